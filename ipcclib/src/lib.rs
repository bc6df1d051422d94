pub mod bundles;
pub mod catalog;
pub mod download;
pub mod extract;
pub mod file;
pub mod hash;
pub mod ledger;
pub mod package;
pub mod pipeline;
pub mod tools;
pub mod vcs;

#[cfg(test)]
mod testutil;
