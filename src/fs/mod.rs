//! On-disk filesystem metadata readers.

pub mod ext;
