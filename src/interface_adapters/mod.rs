// Interface adapters: wire codecs, protocol DTOs, dispatch and clients.

pub mod clients;
pub mod dispatch;
pub mod engine_codec;
pub mod protocol;
pub mod start_script;
