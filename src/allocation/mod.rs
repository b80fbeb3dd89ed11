//! 在途预留：叠加在历史用量之上的软占用。

mod tracker;
mod types;

pub use tracker::{AllocationTracker, DEFAULT_SHARDS};
pub use types::{Hold, InFlight, LeakedReservation, PoolWorkloadAllocation, ReservationTicket};
