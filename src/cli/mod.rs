//! CLI commands for ds3pool
//!
//! Each `cmd_*` function runs one subcommand against a configured
//! [`Ds3Client`](crate::ds3::Ds3Client) and prints text or JSON.
//!
//! ```bash
//! # List buckets, then the objects of one
//! ds3pool service
//! ds3pool ls photos --prefix 2024/
//!
//! # Move files through bulk jobs
//! ds3pool put-bulk photos a.jpg b.jpg --progress
//! ds3pool get-bulk photos a.jpg b.jpg --out ./restore
//!
//! # Inspect and cancel jobs
//! ds3pool jobs
//! ds3pool cancel-job 6b6f2c3e-...
//! ```

pub mod commands;
