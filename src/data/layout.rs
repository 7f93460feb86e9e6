// src/data/layout.rs
//! Shape descriptors of registered data
//!
//! A layout is the opaque interface of a handle as far as the runtime is
//! concerned: it knows the byte size, a structural footprint used to key
//! the allocation cache, and how to cut itself into contiguous pieces.

use crate::utils::errors::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;

static FOOTPRINT_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Structural hash of a layout
///
/// Equal layouts always share a footprint; the converse does not hold, so a
/// footprint match is only a filter before [`DataLayout::same_shape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Footprint(pub u32);

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Shape of registered data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataLayout {
    /// No storage, used for pure synchronization handles
    Void,
    Variable {
        elem_size: usize,
    },
    Vector {
        nx: usize,
        elem_size: usize,
    },
    /// Column-major matrix with no padding between columns
    Matrix {
        nx: usize,
        ny: usize,
        elem_size: usize,
    },
    Block {
        nx: usize,
        ny: usize,
        nz: usize,
        elem_size: usize,
    },
}

/// How to cut a layout into children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionFilter {
    /// Equal slices along the outermost (contiguous) dimension
    Block { nparts: usize },
}

/// One child produced by a partition filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPiece {
    pub layout: DataLayout,

    /// Byte offset of the piece inside its parent
    pub offset: usize,
}

impl DataLayout {
    pub fn vector(nx: usize, elem_size: usize) -> Self {
        DataLayout::Vector { nx, elem_size }
    }

    pub fn matrix(nx: usize, ny: usize, elem_size: usize) -> Self {
        DataLayout::Matrix { nx, ny, elem_size }
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        match *self {
            DataLayout::Void => 0,
            DataLayout::Variable { elem_size } => elem_size,
            DataLayout::Vector { nx, elem_size } => nx * elem_size,
            DataLayout::Matrix { nx, ny, elem_size } => nx * ny * elem_size,
            DataLayout::Block {
                nx,
                ny,
                nz,
                elem_size,
            } => nx * ny * nz * elem_size,
        }
    }

    fn kind_id(&self) -> u8 {
        match self {
            DataLayout::Void => 0,
            DataLayout::Variable { .. } => 1,
            DataLayout::Vector { .. } => 2,
            DataLayout::Matrix { .. } => 3,
            DataLayout::Block { .. } => 4,
        }
    }

    pub fn footprint(&self) -> Footprint {
        let mut digest = FOOTPRINT_CRC.digest();
        digest.update(&[self.kind_id()]);
        let dims: [usize; 4] = match *self {
            DataLayout::Void => [0; 4],
            DataLayout::Variable { elem_size } => [elem_size, 0, 0, 0],
            DataLayout::Vector { nx, elem_size } => [nx, elem_size, 0, 0],
            DataLayout::Matrix { nx, ny, elem_size } => [nx, ny, elem_size, 0],
            DataLayout::Block {
                nx,
                ny,
                nz,
                elem_size,
            } => [nx, ny, nz, elem_size],
        };
        for dim in dims {
            digest.update(&(dim as u64).to_le_bytes());
        }
        Footprint(digest.finalize())
    }

    /// Authoritative shape comparison used after a footprint match
    pub fn same_shape(&self, other: &DataLayout) -> bool {
        self == other
    }

    /// Whether freed buffers of this layout may be kept for reuse
    pub fn cacheable(&self) -> bool {
        !matches!(self, DataLayout::Void)
    }

    /// Cut the layout into contiguous pieces
    pub fn partition(&self, filter: PartitionFilter) -> Result<Vec<LayoutPiece>> {
        let PartitionFilter::Block { nparts } = filter;
        let (extent, stride) = match *self {
            DataLayout::Vector { nx, elem_size } => (nx, elem_size),
            DataLayout::Matrix { nx, ny, elem_size } => (ny, nx * elem_size),
            DataLayout::Block {
                nx,
                ny,
                nz,
                elem_size,
            } => (nz, nx * ny * elem_size),
            _ => {
                return Err(RuntimeError::InvalidPartition(format!(
                    "{:?} cannot be partitioned",
                    self
                )))
            }
        };
        if nparts == 0 || nparts > extent {
            return Err(RuntimeError::InvalidPartition(format!(
                "cannot cut {} slices into {} parts",
                extent, nparts
            )));
        }

        let mut pieces = Vec::with_capacity(nparts);
        let mut start = 0;
        for part in 0..nparts {
            // The first `extent % nparts` pieces get one extra slice
            let len = extent / nparts + usize::from(part < extent % nparts);
            let layout = match *self {
                DataLayout::Vector { elem_size, .. } => DataLayout::Vector { nx: len, elem_size },
                DataLayout::Matrix { nx, elem_size, .. } => DataLayout::Matrix {
                    nx,
                    ny: len,
                    elem_size,
                },
                DataLayout::Block {
                    nx, ny, elem_size, ..
                } => DataLayout::Block {
                    nx,
                    ny,
                    nz: len,
                    elem_size,
                },
                _ => unreachable!("checked above"),
            };
            pieces.push(LayoutPiece {
                layout,
                offset: start * stride,
            });
            start += len;
        }
        Ok(pieces)
    }
}
