//! Identifiers addressing lists and elements across the system

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one list: node index, data pool index, list index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListId {
    pub node: usize,
    pub data_pool: usize,
    pub list: usize,
}

/// Identifies one element inside a list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    pub node: usize,
    pub data_pool: usize,
    pub list: usize,
    pub element: usize,
}

impl ListId {
    pub fn new(node: usize, data_pool: usize, list: usize) -> Self {
        Self {
            node,
            data_pool,
            list,
        }
    }

    pub fn element(self, element: usize) -> ElementId {
        ElementId {
            node: self.node,
            data_pool: self.data_pool,
            list: self.list,
            element,
        }
    }
}

impl ElementId {
    pub fn new(node: usize, data_pool: usize, list: usize, element: usize) -> Self {
        Self {
            node,
            data_pool,
            list,
            element,
        }
    }

    pub fn list_id(&self) -> ListId {
        ListId::new(self.node, self.data_pool, self.list)
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.node, self.data_pool, self.list)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.node, self.data_pool, self.list, self.element
        )
    }
}
