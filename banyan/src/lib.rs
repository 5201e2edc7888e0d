//! Core of the Banyan wallet backend: create spend transactions from a set
//! of wallet coins and coordinate their signing with external keystores.

pub mod sign;
pub mod spend;
pub mod txsizes;

#[cfg(test)]
pub(crate) mod testutils;

pub use miniscript;
