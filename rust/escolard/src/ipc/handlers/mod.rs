pub mod attendance;
pub mod core;
pub mod courses;
pub mod cycles;
pub mod enrollments;
pub mod grades;
pub mod orientations;
pub mod policy;
pub mod reports;
pub mod students;
pub mod subjects;
