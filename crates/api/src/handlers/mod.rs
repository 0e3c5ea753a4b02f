pub mod events;
pub mod inspections;
