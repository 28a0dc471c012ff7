pub mod gate;
pub mod intent;
pub mod pattern;
pub mod policy;
pub mod signature;
