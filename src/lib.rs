// Library for tests to access modules

pub mod compose;
pub mod config;
pub mod engine;
pub mod execution_repo;
pub mod guard;
pub mod models;
pub mod recreate;
pub mod registry;
pub mod router;
pub mod routes;
pub mod scanner;
pub mod selfupdate;
pub mod updater;
pub mod version;
pub mod worker;
