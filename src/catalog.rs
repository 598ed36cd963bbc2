//! Course content: course → section → topic → optional quiz → questions.

pub mod authoring;
pub mod browse;
pub mod course;
pub mod quiz;
