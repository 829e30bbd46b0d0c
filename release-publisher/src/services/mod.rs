pub mod catalog;
pub mod publish;
