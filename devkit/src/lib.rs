/*!
# Hostdeck DevKit - Test helpers for the control plane

Helpers for the kernel test suites:
- Fake worker executables (ready, silent, crashing...) that log their spawns
- Free TCP ports for tests binding real sockets
- Node table fixtures in the on-disk JSON format
*/

pub mod fake_worker;
pub mod fixtures;

pub use fake_worker::{FakeWorker, WorkerBehaviour};
pub use fixtures::{free_port, local_node, remote_node, write_nodes_file};
