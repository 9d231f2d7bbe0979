pub mod autopilot;
pub mod decision;
pub mod evidence;
pub mod invocation;
pub mod outbox;
pub mod run;
pub mod step;
