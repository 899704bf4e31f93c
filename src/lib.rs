//! Tile-based transparency log: a C2SP/RFC 6962-shaped Merkle log over COSE
//! Sign1 statements, served as a small HTTP service.
//!
//! Module map mirrors the component table: [`hash`]/[`tile`] are pure
//! helpers, [`storage`] is the persistence seam (C1/C2), [`tilelog`]/[`proof`]
//! are the Merkle core (C3/C4), [`cose`]/[`checkpoint`] are signing (C8/C5),
//! [`registrar`] is the write pipeline (C6), and [`http`] is the external
//! protocol (C7).

pub mod checkpoint;
pub mod config;
pub mod cose;
pub mod errors;
pub mod hash;
pub mod http;
pub mod metrics;
pub mod proof;
pub mod registrar;
pub mod storage;
pub mod tile;
pub mod tilelog;
