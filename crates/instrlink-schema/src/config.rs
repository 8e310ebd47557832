/// Controls schema loading behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// When true, documents may not carry keys the loader does not know.
    pub strict_mode: bool,
    /// Maximum number of register definitions accepted.
    pub max_registers: usize,
    /// Maximum bytes allowed for a schema document file.
    pub max_document_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            max_registers: 4096,
            max_document_size: 4 * 1024 * 1024,
        }
    }
}
