// Node-level constants shared by every subsystem of the daemon.

// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;

// Ceiling on the hops-to-live budget a request may carry.
// Every link clamps an incoming HTL to this value before decrementing,
// so an inflated HTL from a misbehaving peer buys it nothing.
pub const MAX_HTL: i16 = 10;
