//! Deterministic buffer contents for simulated stages.
//!
//! Every output gets a small header (frame number and producing stage) followed by
//! pseudo-random fill, so tests can tell which frame a delivered buffer came from.

use cam_core::{FrameNumber, StageId};
use cam_pool::Buffer;

const MAGIC: [u8; 4] = *b"CAMF";
const HEADER_LEN: usize = 13;

/// Simple pseudo-random number generator (LCG) for reproducible noise.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

fn stage_code(stage: StageId) -> u8 {
    StageId::ALL
        .iter()
        .position(|s| *s == stage)
        .and_then(|i| u8::try_from(i).ok())
        .unwrap_or(u8::MAX)
}

/// Writes the frame marker and fill into plane 0 of `buffer`.
pub fn stamp(buffer: &mut Buffer, frame: FrameNumber, stage: StageId) {
    let Some(plane) = buffer.plane_mut(0) else {
        return;
    };
    let len = plane.len();
    let mut seed = frame.0.wrapping_mul(2654435761) ^ u64::from(stage_code(stage));
    for byte in plane.iter_mut() {
        seed = prng(seed);
        *byte = (seed & 0xFF) as u8;
    }
    if len >= HEADER_LEN {
        plane[..4].copy_from_slice(&MAGIC);
        plane[4..12].copy_from_slice(&frame.0.to_le_bytes());
        plane[12] = stage_code(stage);
    }
    buffer.set_bytes_used(0, len);
}

/// Reads back the marker written by [`stamp`].
#[must_use]
pub fn read_marker(buffer: &Buffer) -> Option<(FrameNumber, StageId)> {
    let plane = buffer.plane(0)?;
    if plane.len() < HEADER_LEN || plane[..4] != MAGIC {
        return None;
    }
    let mut number = [0u8; 8];
    number.copy_from_slice(&plane[4..12]);
    let stage = StageId::ALL.get(usize::from(plane[12])).copied()?;
    Some((FrameNumber(u64::from_le_bytes(number)), stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cam_pool::{BufferLayout, BufferPool, PoolSpec};

    #[test]
    fn marker_roundtrip() {
        let pool =
            BufferPool::with_heap(PoolSpec::fixed("p", 1, BufferLayout::single_plane(64))).unwrap();
        let mut buffer = pool.try_acquire().unwrap();
        assert!(read_marker(&buffer).is_none());

        stamp(&mut buffer, FrameNumber(77), StageId::Scaler);
        assert_eq!(read_marker(&buffer), Some((FrameNumber(77), StageId::Scaler)));
        assert_eq!(buffer.bytes_used(0), 64);
    }

    #[test]
    fn tiny_planes_get_fill_only() {
        let pool =
            BufferPool::with_heap(PoolSpec::fixed("p", 1, BufferLayout::single_plane(4))).unwrap();
        let mut buffer = pool.try_acquire().unwrap();
        stamp(&mut buffer, FrameNumber(1), StageId::Sensor);
        assert!(read_marker(&buffer).is_none());
    }
}
