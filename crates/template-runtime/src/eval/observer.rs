// Creation hooks for external tooling

use crate::schema::VariableDeclaration;

use super::variable::{VarId, Variable};

/// Notified around every materialization. A failing hook is logged and
/// otherwise ignored.
pub trait Observer {
    fn on_variable_creating(&mut self, _decl: &VariableDeclaration) -> Result<(), String> {
        Ok(())
    }

    fn on_variable_created(
        &mut self,
        _decl: &VariableDeclaration,
        _id: VarId,
        _var: &Variable,
    ) -> Result<(), String> {
        Ok(())
    }
}
