pub mod db_init;

pub mod stock_validator;
pub mod auth_client;

pub mod order_store;
pub mod mongo_order_store;

pub mod broker;
pub mod in_memory_broker;
pub mod amqp_broker;

pub mod event_publisher;
pub mod event_consumer;
pub mod notification;

pub mod order_service;
