// Outbound service clients.

pub mod lobby;
