pub mod acceptor;
pub mod registry;
pub mod worker;

pub use acceptor::{Acceptor, AcceptorFault};
pub use registry::{LiveWorker, WorkerRegistry};
pub use worker::{InjectorWorker, InputMode, WorkerExit, WorkerSettings};
