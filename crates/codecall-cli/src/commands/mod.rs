pub mod call;
pub mod ping;
