//! End-to-end tests through the public database API.
//!
//! Each file covers one scenario: fresh databases in temporary directories,
//! real files, and reopening to observe what reached the disk.

#![cfg(test)]

mod helpers;

mod test_batch_atomicity;
mod test_concurrency;
mod test_crash_recovery;
mod test_default_tree;
mod test_drop_tree;
mod test_persistence;
mod test_random_operations;
mod test_scenarios;
