pub mod activities;
pub mod backup;
pub mod cep;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod exports;
pub mod field_projects;
pub mod profiles;
pub mod setup;
