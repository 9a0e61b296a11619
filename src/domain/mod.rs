//! Pure domain model: value objects, aggregates, events.
pub mod aggregates;
pub mod events;
pub mod value_objects;
