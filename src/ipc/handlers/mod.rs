pub mod backup;
pub mod core;
pub mod exams;
pub mod exports;
pub mod grades;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
