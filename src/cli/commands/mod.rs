pub mod assets;
pub mod config;
pub mod rendezvous;
pub mod task;

pub use assets::FetchAssetsCommand;
pub use config::ConfigCommands;
pub use rendezvous::RendezvousCommand;
pub use task::RunTaskCommand;
