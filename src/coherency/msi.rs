// src/coherency/msi.rs
//! MSI transitions of a handle's replicates

use crate::data::{AccessMode, HandleHeader, MsiState};
use crate::memory::NodeId;

/// Record that `node` now holds the data for an access in `mode`
///
/// Must be called with the header held. A write leaves `node` as the only
/// valid copy and bumps the version; a read shares the data with every
/// other valid copy, or takes ownership when there is none.
pub fn update_data_state(header: &mut HandleHeader, node: NodeId, mode: AccessMode) {
    if mode.writes() {
        for replicate in header.replicates.iter_mut() {
            replicate.state = if replicate.node == node {
                MsiState::Owner
            } else {
                MsiState::Invalid
            };
        }
        header.version += 1;
        return;
    }

    if header.state(node) == MsiState::Owner {
        return;
    }
    let others_valid = header
        .replicates
        .iter()
        .any(|replicate| replicate.node != node && replicate.is_valid());
    if !others_valid {
        header.replicate_mut(node).state = MsiState::Owner;
        return;
    }
    for replicate in header.replicates.iter_mut() {
        if replicate.is_valid() || replicate.node == node {
            replicate.state = MsiState::Shared;
        }
    }
}

/// Node states after merging children back into their father
///
/// The father is valid wherever its buffer holds every child's data.
pub(crate) fn collapse_states(valid: &[bool]) -> Vec<MsiState> {
    let count = valid.iter().filter(|&&v| v).count();
    valid
        .iter()
        .map(|&v| match (v, count) {
            (false, _) => MsiState::Invalid,
            (true, 1) => MsiState::Owner,
            (true, _) => MsiState::Shared,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataHandle, DataLayout, HandleId};
    use crate::memory::BufferAddr;

    fn header_with(states: &[MsiState]) -> std::sync::Arc<DataHandle> {
        let handle = DataHandle::register(
            HandleId(1),
            DataLayout::vector(4, 8),
            Some((NodeId::MAIN_RAM, BufferAddr::new(1))),
            states.len(),
        );
        {
            let mut header = handle.lock();
            for (replicate, state) in header.replicates.iter_mut().zip(states) {
                replicate.state = *state;
            }
        }
        handle
    }

    #[test]
    fn test_write_invalidates_others() {
        let handle = header_with(&[MsiState::Shared, MsiState::Shared, MsiState::Invalid]);
        let mut header = handle.lock();
        update_data_state(&mut header, NodeId(2), AccessMode::ReadWrite);
        assert_eq!(header.owner(), Some(NodeId(2)));
        assert_eq!(header.valid_nodes(), vec![NodeId(2)]);
        assert_eq!(header.version, 1);
        assert!(header.msi_consistent());
    }

    #[test]
    fn test_read_shares_with_owner() {
        let handle = header_with(&[MsiState::Owner, MsiState::Invalid]);
        let mut header = handle.lock();
        update_data_state(&mut header, NodeId(1), AccessMode::Read);
        assert_eq!(header.state(NodeId(0)), MsiState::Shared);
        assert_eq!(header.state(NodeId(1)), MsiState::Shared);
        assert_eq!(header.version, 0);
        assert!(header.msi_consistent());
    }

    #[test]
    fn test_read_of_only_copy_owns_it() {
        let handle = header_with(&[MsiState::Invalid, MsiState::Invalid]);
        let mut header = handle.lock();
        update_data_state(&mut header, NodeId(1), AccessMode::Read);
        assert_eq!(header.owner(), Some(NodeId(1)));

        // Reading again on the owner changes nothing
        update_data_state(&mut header, NodeId(1), AccessMode::Read);
        assert_eq!(header.owner(), Some(NodeId(1)));
        assert_eq!(header.state(NodeId(0)), MsiState::Invalid);
    }

    #[test]
    fn test_collapse_states() {
        assert_eq!(
            collapse_states(&[true, false]),
            vec![MsiState::Owner, MsiState::Invalid]
        );
        assert_eq!(
            collapse_states(&[true, true, false]),
            vec![MsiState::Shared, MsiState::Shared, MsiState::Invalid]
        );
        assert_eq!(collapse_states(&[false, false]), vec![MsiState::Invalid; 2]);
    }
}
