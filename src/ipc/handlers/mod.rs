pub mod academies;
pub mod attendance;
pub mod backup;
pub mod core;
pub mod feeds;
pub mod reports;
pub mod setup;
pub mod students;
pub mod teachers;
pub mod timetable;
