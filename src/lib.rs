//! vulnharvest - vulnerability data harvesting jobs
//!
//! Imports the FSTEC BDU vulnerability export and threat list into a
//! relational store, then enriches stored CVE identifiers with data scraped
//! from NVD and OpenCVE through a bounded, retrying fetch pipeline.

pub mod config;
pub mod extractors;
pub mod feeds;
pub mod http_client;
pub mod jobs;
pub mod logging;
pub mod pipeline;
pub mod reports;
pub mod store;
