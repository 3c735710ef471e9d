//! NVM and data pool access for one node
//!
//! The [`DataDealer`] serializes element values with the protocol's byte
//! order, reads and writes whole lists as one memory transfer, and guards
//! CRC-protected lists with a CRC16-CCITT (seed `0x1D0F`) stored in the
//! first two bytes of the list.
//!
//! The safe-write family (`nvm_safe_*`) is a strict sequence:
//! clear → write changed values → read back → write CRCs. Calls out of
//! order fail with [`DealerError::Sequence`].

use std::sync::Arc;

use crc::{Crc, CRC_16_SPI_FUJITSU};
use parking_lot::Mutex as SyncMutex;
use syde_core::{ByteOrder, Content, ElementId, List, ListId, SharedNode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DealerError;
use crate::protocol::{encode_u16, DiagProtocol};

/// CRC16-CCITT, polynomial 0x1021, seed 0x1D0F, no reflection
pub const NVM_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_SPI_FUJITSU);

/// CRC over the serialized values of `values`
pub fn crc_over_values<'a>(values: impl IntoIterator<Item = &'a Content>, order: ByteOrder) -> u16 {
    let mut digest = NVM_CRC.digest();
    for value in values {
        digest.update(&value.to_bytes(order));
    }
    digest.finalize()
}

/// CRC over every element of `list` in protocol byte order
pub fn nvm_calc_crc(list: &List, order: ByteOrder) -> u16 {
    crc_over_values(list.elements.iter().map(|e| &e.value), order)
}

fn decode_u16(bytes: [u8; 2], order: ByteOrder) -> u16 {
    match order {
        ByteOrder::Little => u16::from_le_bytes(bytes),
        ByteOrder::Big => u16::from_be_bytes(bytes),
    }
}

/// Position of the safe-write sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeWriteStep {
    Idle,
    Cleared,
    ChangedWritten,
    ReadBack,
    ParametersRead,
}

/// List content as read back from the device
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot {
    pub list: ListId,
    pub values: Vec<Content>,
    /// CRC stored on the device, for CRC-protected lists
    pub stored_crc: Option<u16>,
}

#[derive(Debug)]
struct SafeWriteState {
    step: SafeWriteStep,
    lists: Vec<(usize, usize)>,
    snapshot: Vec<ListSnapshot>,
}

/// Layout of a list captured under the node lock
struct ListLayout {
    start: u32,
    num_bytes: usize,
    crc_active: bool,
    /// (offset into the list, current value) per element
    elements: Vec<(usize, Content)>,
}

pub struct DataDealer {
    node_index: usize,
    node: SharedNode,
    protocol: Arc<Mutex<DiagProtocol>>,
    safe: SyncMutex<SafeWriteState>,
}

impl DataDealer {
    pub fn new(node_index: usize, node: SharedNode, protocol: Arc<Mutex<DiagProtocol>>) -> Self {
        Self {
            node_index,
            node,
            protocol,
            safe: SyncMutex::new(SafeWriteState {
                step: SafeWriteStep::Idle,
                lists: Vec::new(),
                snapshot: Vec::new(),
            }),
        }
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn protocol(&self) -> &Arc<Mutex<DiagProtocol>> {
        &self.protocol
    }

    pub fn safe_write_step(&self) -> SafeWriteStep {
        self.safe.lock().step
    }

    fn list_layout(&self, data_pool: usize, list: usize) -> Result<ListLayout, DealerError> {
        let node = self.node.read();
        let definition = node.list(data_pool, list).ok_or_else(|| {
            DealerError::Range(format!("list {}.{} on {}", data_pool, list, node.name))
        })?;

        let num_bytes = definition.num_bytes_used();
        if definition.crc_active && (definition.nvm_size <= 2 || definition.elements.is_empty()) {
            return Err(DealerError::Overflow(format!(
                "list \"{}\" has a CRC but no content",
                definition.name
            )));
        }
        if num_bytes > definition.nvm_size {
            return Err(DealerError::Overflow(format!(
                "list \"{}\" uses {} of {} bytes",
                definition.name, num_bytes, definition.nvm_size
            )));
        }
        if definition.nvm_start.checked_add(num_bytes).is_none() {
            return Err(DealerError::Overflow(format!(
                "list \"{}\" ends beyond the NVM address range",
                definition.name
            )));
        }

        Ok(ListLayout {
            start: definition.nvm_start,
            num_bytes: num_bytes as usize,
            crc_active: definition.crc_active,
            elements: definition
                .elements
                .iter()
                .map(|e| ((e.nvm_address.saturating_sub(definition.nvm_start)) as usize, e.value))
                .collect(),
        })
    }

    fn element_value(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<(u32, Content), DealerError> {
        let node = self.node.read();
        node.element(data_pool, list, element)
            .map(|e| (e.nvm_address, e.value))
            .ok_or_else(|| {
                DealerError::Range(format!(
                    "element {}.{}.{} on {}",
                    data_pool, list, element, node.name
                ))
            })
    }

    fn apply_value(&self, data_pool: usize, list: usize, element: usize, value: Content) {
        let mut node = self.node.write();
        if let Some(e) = node.element_mut(data_pool, list, element) {
            e.value = value;
            e.valid = true;
        }
    }

    // =========================================================================
    // Single elements
    // =========================================================================

    /// Read the RAM value of an element
    pub async fn data_pool_read(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<Content, DealerError> {
        let (_, template) = self.element_value(data_pool, list, element)?;
        let protocol = self.protocol.lock().await;
        let raw = protocol.data_pool_read(data_pool, list, element).await?;
        let order = protocol.endianness();
        drop(protocol);

        if raw.len() != template.size() {
            return Err(DealerError::SizeMismatch {
                expected: template.size(),
                actual: raw.len(),
            });
        }
        let value = decode(&template, &raw, order)?;
        self.apply_value(data_pool, list, element, value);
        Ok(value)
    }

    /// Write the current client value of an element to RAM
    pub async fn data_pool_write(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<(), DealerError> {
        let (_, value) = self.element_value(data_pool, list, element)?;
        let protocol = self.protocol.lock().await;
        let bytes = value.to_bytes(protocol.endianness());
        protocol
            .data_pool_write(data_pool, list, element, &bytes)
            .await?;
        Ok(())
    }

    /// Read one element from NVM
    pub async fn nvm_read(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<Content, DealerError> {
        let (address, template) = self.element_value(data_pool, list, element)?;
        let protocol = self.protocol.lock().await;
        let raw = protocol.read(address, template.size()).await?;
        let order = protocol.endianness();
        drop(protocol);

        if raw.len() < template.size() {
            return Err(DealerError::SizeMismatch {
                expected: template.size(),
                actual: raw.len(),
            });
        }
        let value = decode(&template, &raw, order)?;
        self.apply_value(data_pool, list, element, value);
        Ok(value)
    }

    /// Write one element to NVM
    ///
    /// The list CRC is not updated.
    pub async fn nvm_write(
        &self,
        data_pool: usize,
        list: usize,
        element: usize,
    ) -> Result<(), DealerError> {
        let (address, value) = self.element_value(data_pool, list, element)?;
        let protocol = self.protocol.lock().await;
        let bytes = value.to_bytes(protocol.endianness());
        protocol.write(address, &bytes).await?;
        Ok(())
    }

    // =========================================================================
    // Lists
    // =========================================================================

    /// Read a whole list from NVM and check its CRC
    ///
    /// Elements are decoded in order and marked valid as they are decoded.
    /// A short response stops decoding at the first element that does not
    /// fit. The CRC is checked after decoding.
    pub async fn nvm_read_list(&self, data_pool: usize, list: usize) -> Result<(), DealerError> {
        let layout = self.list_layout(data_pool, list)?;
        if layout.num_bytes == 0 {
            return Ok(());
        }

        let protocol = self.protocol.lock().await;
        let raw = protocol.read(layout.start, layout.num_bytes).await?;
        let order = protocol.endianness();
        drop(protocol);

        let mut decoded = Vec::with_capacity(layout.elements.len());
        let mut short = None;
        for (offset, template) in &layout.elements {
            let end = offset + template.size();
            match raw.get(*offset..end) {
                Some(bytes) => decoded.push(decode(template, bytes, order)?),
                None => {
                    short = Some(DealerError::SizeMismatch {
                        expected: layout.num_bytes,
                        actual: raw.len(),
                    });
                    break;
                }
            }
        }

        let mut node = self.node.write();
        let node_name = node.name.clone();
        let target = node
            .list_mut(data_pool, list)
            .ok_or_else(|| DealerError::Range(format!("list {}.{}", data_pool, list)))?;
        for (element, value) in target.elements.iter_mut().zip(decoded) {
            element.value = value;
            element.valid = true;
        }
        if let Some(err) = short {
            warn!(node = %node_name, data_pool, list, %err, "NVM list read incomplete");
            return Err(err);
        }

        if layout.crc_active {
            let stored = raw
                .get(0..2)
                .map(|b| decode_u16([b[0], b[1]], order))
                .ok_or(DealerError::SizeMismatch {
                    expected: 2,
                    actual: raw.len(),
                })?;
            target.crc = stored;
            let computed = nvm_calc_crc(target, order);
            if stored != computed {
                warn!(
                    node = %node_name,
                    data_pool,
                    list,
                    stored = format!("0x{:04X}", stored),
                    computed = format!("0x{:04X}", computed),
                    "NVM list CRC mismatch"
                );
                return Err(DealerError::ChecksumMismatch { stored, computed });
            }
        }

        debug!(node = %node_name, data_pool, list, bytes = raw.len(), "NVM list read");
        Ok(())
    }

    /// Write a whole list to NVM, CRC included
    pub async fn nvm_write_list(&self, data_pool: usize, list: usize) -> Result<(), DealerError> {
        let layout = self.list_layout(data_pool, list)?;
        if layout.num_bytes == 0 {
            return Ok(());
        }

        let protocol = self.protocol.lock().await;
        let order = protocol.endianness();
        let mut buffer = vec![0u8; layout.num_bytes];
        for (offset, value) in &layout.elements {
            let bytes = value.to_bytes(order);
            buffer[*offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        let crc = if layout.crc_active {
            let crc = crc_over_values(layout.elements.iter().map(|(_, v)| v), order);
            buffer[0..2].copy_from_slice(&encode_u16(crc, order));
            Some(crc)
        } else {
            None
        };
        protocol.write(layout.start, &buffer).await?;
        drop(protocol);

        if let Some(crc) = crc {
            if let Some(target) = self.node.write().list_mut(data_pool, list) {
                target.crc = crc;
            }
        }
        Ok(())
    }

    /// Notify the server application that a list changed in NVM
    pub async fn nvm_notify_of_changes(
        &self,
        data_pool: usize,
        list: usize,
    ) -> Result<bool, DealerError> {
        self.list_layout(data_pool, list)?;
        let protocol = self.protocol.lock().await;
        Ok(protocol.nvm_notify_of_changes(data_pool, list).await?)
    }

    async fn read_snapshot(&self, data_pool: usize, list: usize) -> Result<ListSnapshot, DealerError> {
        let layout = self.list_layout(data_pool, list)?;
        let protocol = self.protocol.lock().await;
        let raw = if layout.num_bytes == 0 {
            Vec::new()
        } else {
            protocol.read(layout.start, layout.num_bytes).await?
        };
        let order = protocol.endianness();
        drop(protocol);

        if raw.len() < layout.num_bytes {
            return Err(DealerError::SizeMismatch {
                expected: layout.num_bytes,
                actual: raw.len(),
            });
        }
        let values = layout
            .elements
            .iter()
            .map(|(offset, template)| decode(template, &raw[*offset..offset + template.size()], order))
            .collect::<Result<Vec<_>, _>>()?;
        let stored_crc = layout
            .crc_active
            .then(|| decode_u16([raw[0], raw[1]], order));

        Ok(ListSnapshot {
            list: ListId::new(self.node_index, data_pool, list),
            values,
            stored_crc,
        })
    }

    // =========================================================================
    // Safe write sequence
    // =========================================================================

    fn require_step(&self, operation: &str, expected: SafeWriteStep) -> Result<(), DealerError> {
        let step = self.safe.lock().step;
        if step != expected {
            return Err(DealerError::Sequence(format!(
                "{} requires step {:?}, current step is {:?}",
                operation, expected, step
            )));
        }
        Ok(())
    }

    /// Reset the safe-write sequence
    pub fn nvm_safe_clear_internal_content(&self) {
        let mut state = self.safe.lock();
        state.step = SafeWriteStep::Cleared;
        state.lists.clear();
        state.snapshot.clear();
    }

    /// Write every element whose device value differs from the client value
    ///
    /// Returns the ids of the written elements.
    pub async fn nvm_safe_write_changed_values(
        &self,
        lists: &[(usize, usize)],
    ) -> Result<Vec<ElementId>, DealerError> {
        self.require_step("write changed values", SafeWriteStep::Cleared)?;

        let mut changed = Vec::new();
        for &(data_pool, list) in lists {
            let layout = self.list_layout(data_pool, list)?;
            let protocol = self.protocol.lock().await;
            let order = protocol.endianness();
            let raw = if layout.num_bytes == 0 {
                Vec::new()
            } else {
                protocol.read(layout.start, layout.num_bytes).await?
            };
            if raw.len() < layout.num_bytes {
                return Err(DealerError::SizeMismatch {
                    expected: layout.num_bytes,
                    actual: raw.len(),
                });
            }

            for (index, (offset, value)) in layout.elements.iter().enumerate() {
                let bytes = value.to_bytes(order);
                if raw[*offset..offset + bytes.len()] != bytes[..] {
                    protocol.write(layout.start + *offset as u32, &bytes).await?;
                    changed.push(ElementId::new(self.node_index, data_pool, list, index));
                }
            }
        }

        let mut state = self.safe.lock();
        state.lists = lists.to_vec();
        state.step = SafeWriteStep::ChangedWritten;
        info!(node = self.node_index, changed = changed.len(), "Changed NVM values written");
        Ok(changed)
    }

    /// Read back the lists touched by the last write
    pub async fn nvm_safe_read_values(&self) -> Result<Vec<ListSnapshot>, DealerError> {
        self.require_step("read values", SafeWriteStep::ChangedWritten)?;
        let lists = self.safe.lock().lists.clone();

        let mut snapshot = Vec::with_capacity(lists.len());
        for (data_pool, list) in lists {
            snapshot.push(self.read_snapshot(data_pool, list).await?);
        }

        let mut state = self.safe.lock();
        state.snapshot = snapshot.clone();
        state.step = SafeWriteStep::ReadBack;
        Ok(snapshot)
    }

    /// Write fresh CRCs for the read-back lists
    pub async fn nvm_safe_write_crcs(&self) -> Result<(), DealerError> {
        self.require_step("write CRCs", SafeWriteStep::ReadBack)?;
        let snapshot = self.safe.lock().snapshot.clone();

        let protocol = self.protocol.lock().await;
        let order = protocol.endianness();
        for entry in snapshot.iter().filter(|s| s.stored_crc.is_some()) {
            let layout = self.list_layout(entry.list.data_pool, entry.list.list)?;
            let crc = crc_over_values(&entry.values, order);
            protocol.write(layout.start, &encode_u16(crc, order)).await?;
            if let Some(target) = self
                .node
                .write()
                .list_mut(entry.list.data_pool, entry.list.list)
            {
                target.crc = crc;
            }
        }
        drop(protocol);

        self.safe.lock().step = SafeWriteStep::Idle;
        Ok(())
    }

    /// Read lists for a parameter set export, checking their CRCs
    pub async fn nvm_safe_read_parameter_values(
        &self,
        lists: &[(usize, usize)],
    ) -> Result<Vec<ListSnapshot>, DealerError> {
        self.require_step("read parameter values", SafeWriteStep::Cleared)?;

        let order = self.protocol.lock().await.endianness();
        let mut snapshot = Vec::with_capacity(lists.len());
        for &(data_pool, list) in lists {
            let entry = self.read_snapshot(data_pool, list).await?;
            if let Some(stored) = entry.stored_crc {
                let computed = crc_over_values(&entry.values, order);
                if stored != computed {
                    return Err(DealerError::ChecksumMismatch { stored, computed });
                }
            }
            snapshot.push(entry);
        }

        let mut state = self.safe.lock();
        state.lists = lists.to_vec();
        state.snapshot = snapshot.clone();
        state.step = SafeWriteStep::ParametersRead;
        Ok(snapshot)
    }
}

fn decode(template: &Content, bytes: &[u8], order: ByteOrder) -> Result<Content, DealerError> {
    template
        .decode(bytes, order)
        .map_err(|_| DealerError::SizeMismatch {
            expected: template.size(),
            actual: bytes.len(),
        })
}
