pub mod backup;
pub mod compute;
pub mod core;
pub mod gradebook;
pub mod roster;
pub mod scores;
pub mod transmutation;
