use std::fmt;

use gpu_memory_manager::ImportedPtr;

/// Owner of the IPC mappings behind one imported column and its children.
///
/// Dropping it closes every handle it opened. Views built from these
/// mappings must not be dereferenced afterwards.
pub struct ImportedColumn {
    name: String,
    data: Option<ImportedPtr>,
    validity: Option<ImportedPtr>,
    children: Vec<ImportedColumn>,
}

impl ImportedColumn {
    pub(crate) fn new(
        name: String,
        data: Option<ImportedPtr>,
        validity: Option<ImportedPtr>,
        children: Vec<ImportedColumn>,
    ) -> Self {
        Self {
            name,
            data,
            validity,
            children,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[ImportedColumn] {
        &self.children
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_validity(&self) -> bool {
        self.validity.is_some()
    }

    /// Number of open mappings owned by this column and its descendants.
    pub fn open_handles(&self) -> usize {
        self.data.is_some() as usize
            + self.validity.is_some() as usize
            + self.children.iter().map(ImportedColumn::open_handles).sum::<usize>()
    }
}

impl fmt::Debug for ImportedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedColumn")
            .field("name", &self.name)
            .field("data", &self.data)
            .field("validity", &self.validity)
            .field("children", &self.children)
            .finish()
    }
}
