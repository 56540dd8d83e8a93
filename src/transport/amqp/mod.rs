// src/transport/amqp/mod.rs

//! AMQP 0-9-1 transport (RabbitMQ), built on `lapin`.

mod transport;

pub use transport::create_transport;
