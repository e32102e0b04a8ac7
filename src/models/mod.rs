pub mod event;
pub mod load;

pub use event::{LoadEvent, Snapshot};
pub use load::{
    DispatcherId, DriverId, Load, LoadId, LoadStatus, NewLoad, TransitionError, newest_first,
    sort_newest_first,
};
