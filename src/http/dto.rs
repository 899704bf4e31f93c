//! JSON wire types for the non-COSE endpoints (spec §6.1). All field names
//! are `snake_case`; identifier hex is lowercase, matching the donor's JSON
//! response conventions.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RegistrationJson {
    pub entry_id: u64,
    pub statement_hash: String,
}

#[derive(Debug, Serialize)]
pub struct TransparencyConfiguration {
    pub origin: String,
    pub hash_algorithm: &'static str,
    pub verifiable_data_structure: &'static str,
    pub tile_height: u8,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub tree_size: u64,
}
