pub mod dispatcher;
pub mod planner;
pub mod reconciler;
pub mod secret;
pub mod status;
