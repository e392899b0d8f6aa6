pub mod command_state;
pub mod event_payload;
pub mod idle;
pub mod models;
pub mod pricing;
pub mod session_energy;
pub mod session_state;
