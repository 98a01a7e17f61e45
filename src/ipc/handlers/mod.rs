pub mod absences;
pub mod attendance;
pub mod backup_exchange;
pub mod calendar;
pub mod classes;
pub mod core;
pub mod justify;
pub mod sessions;
pub mod setup;
pub mod students;
pub mod timetable;
