//! Background workers

pub mod preemption;
