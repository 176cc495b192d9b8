//! Halo reduction between the roles of a PME group. Forward runs after spreading: each role's
//! halo contributions are added into the roles owning those cells. Backward runs after the
//! inverse transform: owners copy their potential out to every role holding those cells as halo,
//! so gathering sees the full spline support. Both are collective over the group, and block until
//! complete.

use crate::{
    PmeError,
    comm::{RoleGroup, Tag},
    grid::PmeGrid,
    wire::{decode_f64s, encode_f64s},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SumDirection {
    /// Halo contributions summed into owners.
    Forward,
    /// Owner values copied out to halos.
    Backward,
}

fn pack(grid: &PmeGrid, cols: &[(usize, usize)]) -> Vec<f64> {
    let nz = grid.decomp.dims[2];
    let mut buf = Vec::with_capacity(cols.len() * nz);
    for &(ix, iy) in cols {
        buf.extend_from_slice(grid.column(ix, iy));
    }
    buf
}

/// Apply a received buffer to `cols`, either adding or overwriting.
fn unpack(
    grid: &mut PmeGrid,
    cols: &[(usize, usize)],
    buf: &[f64],
    add: bool,
) -> Result<(), PmeError> {
    let nz = grid.decomp.dims[2];
    if buf.len() != cols.len() * nz {
        return Err(PmeError::Transport(format!(
            "Halo buffer has {} values; expected {}",
            buf.len(),
            cols.len() * nz
        )));
    }

    for (&(ix, iy), line) in cols.iter().zip(buf.chunks_exact(nz)) {
        let col = grid.column_mut(ix, iy);
        if add {
            for (c, v) in col.iter_mut().zip(line) {
                *c += v;
            }
        } else {
            col.copy_from_slice(line);
        }
    }
    Ok(())
}

/// Sum (forward) or broadcast (backward) the grid's halo regions across `group`, which must be
/// the PME group the grid was decomposed over. With `reproducible`, contributions are added in
/// rank order; otherwise in arrival order, which can change the last bits of cells that several
/// roles contribute to.
pub fn sum_qgrid(
    grid: &mut PmeGrid,
    group: &RoleGroup,
    direction: SumDirection,
    reproducible: bool,
) -> Result<(), PmeError> {
    if group.size() != grid.decomp.size() || group.rank() != grid.rank {
        return Err(PmeError::Protocol(format!(
            "Grid of rank {} in a group of {} summed over rank {} of {}",
            grid.rank,
            grid.decomp.size(),
            group.rank(),
            group.size()
        )));
    }

    let me = grid.rank;
    let map = grid.halo_map.clone();

    // In the forward direction we send halos and receive into owned cells; backward is the
    // reverse.
    let (out_cols, in_cols, tag, add) = match direction {
        SumDirection::Forward => (&map.send, &map.recv, Tag::HaloForward(grid.index), true),
        SumDirection::Backward => (&map.recv, &map.send, Tag::HaloBackward(grid.index), false),
    };

    for (peer, cols) in out_cols.iter().enumerate() {
        if peer == me || cols.is_empty() {
            continue;
        }
        group.send(peer, tag, encode_f64s(&pack(grid, cols))?)?;
    }

    // Our own halo, if it wraps onto cells we own.
    if !out_cols[me].is_empty() {
        let buf = pack(grid, &out_cols[me]);
        unpack(grid, &in_cols[me], &buf, add)?;
    }

    let mut sources: Vec<usize> = (0..group.size())
        .filter(|&p| p != me && !in_cols[p].is_empty())
        .collect();

    if reproducible {
        for &src in &sources {
            let buf = decode_f64s(&group.recv(src, tag)?)?;
            unpack(grid, &in_cols[src], &buf, add)?;
        }
    } else {
        while !sources.is_empty() {
            let (src, bytes) = group.recv_any(&sources, tag)?;
            let buf = decode_f64s(&bytes)?;
            unpack(grid, &in_cols[src], &buf, add)?;
            sources.retain(|&s| s != src);
        }
    }

    Ok(())
}
