pub mod supervisor;

pub use supervisor::JobSupervisor;
