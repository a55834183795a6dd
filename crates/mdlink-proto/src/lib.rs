/// Device to mediator control messages.
pub mod d2m {
    include!(concat!(env!("OUT_DIR"), "/mdlink.d2m.rs"));
}

/// Device to device payloads, reflected through the mediator.
#[allow(clippy::large_enum_variant)]
pub mod d2d {
    include!(concat!(env!("OUT_DIR"), "/mdlink.d2d.rs"));
}

/// Chat server payloads, proxied through the mediator.
pub mod csp {
    include!(concat!(env!("OUT_DIR"), "/mdlink.csp.rs"));
}

pub use prost::Message;
