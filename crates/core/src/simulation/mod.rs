mod movement;
mod tick;

pub use movement::{LinearMovement, MovementInput, MovementModel};
pub use tick::{FixedTimestep, TickContext, TickDriver, TickParticipant};
