use crate::errors::Result;
use crate::manager::LinkManager;

/// Extension loaded when the manager initialises and unloaded on destroy.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, manager: &LinkManager) -> Result<()>;

    fn unload(&self, _manager: &LinkManager) -> Result<()> {
        Ok(())
    }
}
