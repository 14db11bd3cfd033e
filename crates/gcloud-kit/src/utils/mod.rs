pub mod duration;

pub use duration::parse_relative_duration;
