pub mod adminscan;
pub mod announce;
pub mod geofence;
pub mod keyrepair;
pub mod maintenance;
pub mod responder;
pub mod timers;
pub mod timesync;
pub mod traceroute;
pub mod welcome;
