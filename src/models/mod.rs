pub mod derived;
pub mod job;
pub mod league_match;
