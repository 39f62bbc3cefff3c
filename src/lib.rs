// src/lib.rs

// On déclare tous nos modules principaux pour les rendre publics et
// utilisables par le binaire du serveur (relay_server.rs).
pub mod alarm;
pub mod config;
pub mod das;
pub mod decoders;
pub mod listener;
pub mod monitoring;
pub mod pda;
pub mod relay;
pub mod server;
pub mod storage;
