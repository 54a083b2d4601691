pub mod actuators;
pub mod charge_controller;
pub mod clock;
pub mod config;
pub mod control_loop;
pub mod liveness;
pub mod throttler;

pub use charge_controller::{select_level, ChargeController, ChargeOutcome, ChargeReport};
pub use config::BalancerConfig;
pub use control_loop::{ControlLoop, FailSafe, InverterAction, TickOutcome, TickReport};
pub use throttler::Throttler;
