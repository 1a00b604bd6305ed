pub mod crop_yield;
pub mod imagery;
pub mod open_meteo;
pub mod rainfall;
pub mod registry;
pub mod satellite;
pub mod vegetation;
