// =============================================================================
// State & persistence — in-memory trader map and the Postgres repository
// =============================================================================

pub mod db;
pub mod trader_state;
