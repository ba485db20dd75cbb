// Order book stream library
// core: types, config, logging
// layer1: stream and snapshot connectors
// layer2: parsing, synchronization, engine
// layer3: presentation-facing aggregation

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
