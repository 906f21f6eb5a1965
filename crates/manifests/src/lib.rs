//! Manifest handling: multi-document parsing, stack checksums, and the
//! metadata mixer that stamps stack provenance onto manifests.

#![forbid(unsafe_code)]

mod checksum;
mod parse;
mod stamp;

pub use checksum::repo_checksum;
pub use parse::parse_multidoc;
pub use stamp::stamp_metadata;
