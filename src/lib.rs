//! OAT image writer.
//!
//! Serializes a set of DEX containers together with their ahead-of-time
//! compiled code, stubs, and per-method metadata into one linearly laid-out
//! OAT file. The writer plans every byte offset up front ([`OatWriter::new`])
//! and then emits onto that plan ([`OatWriter::write`]); compiled artifacts
//! shared by the compiler are stored once and referenced everywhere else.
//!
//! The compiler, verifier, input containers, output stream, and (for boot
//! images) the runtime method registry are all consumed through traits; see
//! [`compiler`], [`dex`], [`stream`], and [`image`].

pub mod arch;
pub mod compiler;
pub mod dex;
pub mod header;
pub mod image;
pub mod stream;
pub mod tables;
pub mod writer;

mod dedup;

pub use writer::OatWriter;
