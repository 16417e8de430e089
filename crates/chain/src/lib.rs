pub mod generate;
pub mod memory;
pub mod rlp;
pub mod types;
