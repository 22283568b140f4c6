//! pivot_bridge - client-side bridge to the pivot engine
//!
//! The bridge drives a long-lived external engine process over a
//! line-oriented JSON protocol and exchanges bulk geometry data with it
//! through named shared memory, keeping the control channel free of bulk
//! bytes.
//!
//! # Architecture
//!
//! - **Channel** ([`EngineChannel`]): owns the engine child process and
//!   its stdin/stdout pipes; synchronous calls, fire-and-forget calls,
//!   and id-correlated waits, all strictly serialized
//! - **Segments** ([`ShmSegment`]): RAII handles to named shared memory
//!   regions with create/open/close/unlink semantics
//! - **Planning** ([`plan`]): pure name/size computation so both sides
//!   agree on a segment cohort from one transmitted identifier
//!
//! A typical exchange: plan a segment set, create the segments, send a
//! command naming the shared identifier, let the engine open the same
//! segments, then read results from shared memory or from a correlated
//! response line. The command/response round trip is the synchronization
//! barrier for the mapped bytes.

pub mod channel;
pub mod error;
pub mod plan;
pub mod shm;
pub mod uid;

pub use channel::{resolve_engine_binary, ChannelConfig, EngineChannel};
pub use error::{BridgeError, Result};
pub use plan::{
    plan_face_sizes_segment, plan_faces_segment, plan_geometry_segments, FaceSizesPlan, FacesPlan,
    GeometrySegmentsPlan,
};
pub use shm::ShmSegment;
pub use uid::new_id;

/// Runtime platform tag, e.g. `linux-x86-64` or `macos-arm64`.
///
/// Matches the spelling the engine distribution uses for its release
/// artifacts, so hosts can pick a bundled binary by tag.
pub fn platform_id() -> String {
    let system = match std::env::consts::OS {
        os @ ("linux" | "macos" | "windows") => os,
        _ => "unknown",
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x86-64",
        "aarch64" => "arm64",
        _ => "unknown",
    };
    format!("{system}-{arch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_id_shape() {
        let id = platform_id();
        let (system, arch) = id.split_once('-').unwrap();
        assert!(["linux", "macos", "windows", "unknown"].contains(&system));
        assert!(["x86-64", "arm64", "unknown"].contains(&arch));
    }
}
