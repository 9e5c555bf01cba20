mod single_flight;

pub use single_flight::{FlightFuture, FlightOutcome, FlightTicket, SingleFlight};
