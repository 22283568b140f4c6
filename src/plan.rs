//! Pure name/size planning for grouped geometry segments
//!
//! These functions allocate nothing and touch no OS state. They compute
//! the exact names and byte sizes both sides of the bridge use, so the
//! host can create the segments and the engine can open them knowing only
//! the identifier carried in the command payload.

use crate::error::{BridgeError, Result};
use crate::uid;

/// All numeric components are 32-bit on the wire
const COMPONENT_WIDTH: u64 = 4;

const VERTS_TAG: &str = "sp_v_";
const EDGES_TAG: &str = "sp_e_";
const ROTATIONS_TAG: &str = "sp_r_";
const SCALES_TAG: &str = "sp_s_";
const OFFSETS_TAG: &str = "sp_o_";
const FACE_SIZES_TAG: &str = "sp_fs_";
const FACES_TAG: &str = "sp_f_";

fn segment_size(count: u32, components: u64, what: &str) -> Result<usize> {
    let bytes = (count as u64)
        .checked_mul(components)
        .and_then(|n| n.checked_mul(COMPONENT_WIDTH))
        .ok_or_else(|| {
            BridgeError::InvalidArgument(format!("{what} segment size overflows: {count} elements"))
        })?;
    usize::try_from(bytes).map_err(|_| {
        BridgeError::InvalidArgument(format!("{what} segment size exceeds address space: {bytes}"))
    })
}

/// Plan for the five per-scene geometry buffers, grouped under one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometrySegmentsPlan {
    pub uid: String,

    pub verts_name: String,
    pub edges_name: String,
    pub rotations_name: String,
    pub scales_name: String,
    pub offsets_name: String,

    pub verts_size: usize,
    pub edges_size: usize,
    pub rotations_size: usize,
    pub scales_size: usize,
    pub offsets_size: usize,
}

/// Compute names and sizes for a geometry segment cohort.
///
/// Strides: vertices xyz, edges endpoint pair, per-object rotation
/// quaternion, scale xyz, offset xyz. One fresh identifier is embedded in
/// all five names.
pub fn plan_geometry_segments(
    total_verts: u32,
    total_edges: u32,
    total_objects: u32,
) -> Result<GeometrySegmentsPlan> {
    let verts_size = segment_size(total_verts, 3, "verts")?;
    let edges_size = segment_size(total_edges, 2, "edges")?;
    let rotations_size = segment_size(total_objects, 4, "rotations")?;
    let scales_size = segment_size(total_objects, 3, "scales")?;
    let offsets_size = segment_size(total_objects, 3, "offsets")?;

    let uid = uid::new_id();

    Ok(GeometrySegmentsPlan {
        verts_name: format!("{VERTS_TAG}{uid}"),
        edges_name: format!("{EDGES_TAG}{uid}"),
        rotations_name: format!("{ROTATIONS_TAG}{uid}"),
        scales_name: format!("{SCALES_TAG}{uid}"),
        offsets_name: format!("{OFFSETS_TAG}{uid}"),
        uid,
        verts_size,
        edges_size,
        rotations_size,
        scales_size,
        offsets_size,
    })
}

/// Plan for the per-face vertex-count table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceSizesPlan {
    pub uid: String,
    pub face_sizes_name: String,
    pub face_sizes_size: usize,
}

/// One u32 per face, under a fresh identifier.
pub fn plan_face_sizes_segment(total_faces_count: u32) -> Result<FaceSizesPlan> {
    let face_sizes_size = segment_size(total_faces_count, 1, "face sizes")?;
    let uid = uid::new_id();
    Ok(FaceSizesPlan {
        face_sizes_name: format!("{FACE_SIZES_TAG}{uid}"),
        uid,
        face_sizes_size,
    })
}

/// Plan for the flattened face-index table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacesPlan {
    pub faces_name: String,
    pub faces_size: usize,
}

/// One u32 per face-vertex reference. Takes the caller's identifier so the
/// index table groups with a face-size segment planned earlier.
pub fn plan_faces_segment(total_face_vertices: u32, uid: &str) -> Result<FacesPlan> {
    let faces_size = segment_size(total_face_vertices, 1, "faces")?;
    Ok(FacesPlan {
        faces_name: format!("{FACES_TAG}{uid}"),
        faces_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_sizes_exact() {
        let plan = plan_geometry_segments(10, 7, 3).unwrap();
        assert_eq!(plan.verts_size, 10 * 12);
        assert_eq!(plan.edges_size, 7 * 8);
        assert_eq!(plan.rotations_size, 3 * 16);
        assert_eq!(plan.scales_size, 3 * 12);
        assert_eq!(plan.offsets_size, 3 * 12);
    }

    #[test]
    fn test_geometry_names_share_one_uid() {
        let plan = plan_geometry_segments(1, 1, 1).unwrap();
        assert_eq!(plan.uid.len(), uid::ID_LEN);
        assert_eq!(plan.verts_name, format!("sp_v_{}", plan.uid));
        assert_eq!(plan.edges_name, format!("sp_e_{}", plan.uid));
        assert_eq!(plan.rotations_name, format!("sp_r_{}", plan.uid));
        assert_eq!(plan.scales_name, format!("sp_s_{}", plan.uid));
        assert_eq!(plan.offsets_name, format!("sp_o_{}", plan.uid));
    }

    #[test]
    fn test_two_plans_never_collide() {
        let a = plan_geometry_segments(5, 5, 5).unwrap();
        let b = plan_geometry_segments(5, 5, 5).unwrap();
        assert_ne!(a.uid, b.uid);
        assert_ne!(a.verts_name, b.verts_name);
    }

    #[test]
    fn test_zero_counts_plan_empty_segments() {
        // The planner itself accepts zero; segment creation is where a
        // zero size gets rejected
        let plan = plan_geometry_segments(0, 0, 0).unwrap();
        assert_eq!(plan.verts_size, 0);
        assert_eq!(plan.offsets_size, 0);
    }

    #[test]
    fn test_face_sizes_plan() {
        let plan = plan_face_sizes_segment(9).unwrap();
        assert_eq!(plan.face_sizes_size, 36);
        assert_eq!(plan.face_sizes_name, format!("sp_fs_{}", plan.uid));
    }

    #[test]
    fn test_faces_plan_reuses_caller_uid() {
        let sizes = plan_face_sizes_segment(4).unwrap();
        let faces = plan_faces_segment(13, &sizes.uid).unwrap();
        assert_eq!(faces.faces_size, 52);
        assert_eq!(faces.faces_name, format!("sp_f_{}", sizes.uid));
    }

    #[test]
    fn test_max_counts_do_not_wrap() {
        // u32::MAX verts * 12 bytes stays well inside u64
        let plan = plan_geometry_segments(u32::MAX, u32::MAX, u32::MAX);
        #[cfg(target_pointer_width = "64")]
        {
            let plan = plan.unwrap();
            assert_eq!(plan.verts_size, u32::MAX as usize * 12);
        }
        #[cfg(target_pointer_width = "32")]
        assert!(plan.is_err());
    }
}
