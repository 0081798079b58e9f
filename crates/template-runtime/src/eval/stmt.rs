// Statement execution for the runtime
use super::*;
use crate::error::ErrorKind;
use crate::schema::{Dim, VariableDeclaration};

impl<'a> Runtime<'a> {
    /// Execute statements in order in the current scope
    pub(crate) fn exec_block(
        &mut self,
        stmts: &[Stmt],
        ev: &mut dyn ExprEvaluator,
    ) -> Result<(), EvalError> {
        for stmt in stmts {
            self.exec_stmt(stmt, ev)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt, ev: &mut dyn ExprEvaluator) -> Result<(), EvalError> {
        match stmt {
            Stmt::Declare(decl) => {
                let evaluated = self
                    .evaluate_declaration(decl, ev)
                    .map_err(|e| e.with_span_if_none(decl.span))?;
                let scope = self.current_scope();
                decl.materialize(self, scope, evaluated, ev)?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if ev.evaluate(*cond, self)?.to_bool()? {
                    self.exec_block(then_body, ev)?;
                } else {
                    self.exec_block(else_body, ev)?;
                }
            }
            Stmt::While { cond, body } => {
                let limit = self.config.max_loop_iterations;
                let mut iterations = 0u64;
                while ev.evaluate(*cond, self)?.to_bool()? {
                    iterations += 1;
                    if iterations > limit {
                        return Err(ErrorKind::Limit {
                            what: "loop iterations",
                            limit,
                        }
                        .into());
                    }
                    self.exec_block(body, ev)?;
                }
            }
            Stmt::Eval(expr) => {
                ev.evaluate(*expr, self)?;
            }
        }
        Ok(())
    }

    /// Ask the evaluator for everything a declaration needs before it can
    /// be materialized.
    pub fn evaluate_declaration(
        &mut self,
        decl: &VariableDeclaration,
        ev: &mut dyn ExprEvaluator,
    ) -> Result<Evaluated, EvalError> {
        let mut evaluated = Evaluated::default();
        for dim in &decl.dims {
            evaluated.dims.push(match dim {
                Dim::Const(n) => Some(*n),
                Dim::Dynamic(expr) => Some(ev.evaluate(*expr, self)?.to_count("array length")?),
            });
        }
        if let Some(Dim::Dynamic(expr)) = decl.bit_width {
            evaluated.bit_width = Some(ev.evaluate(expr, self)?.to_signed()? as i128);
        }
        for arg in &decl.args {
            let arg = ev.argument(*arg, self)?;
            evaluated.args.push(arg);
        }
        if let Some(init) = decl.initializer {
            evaluated.initializer = Some(ev.evaluate(init, self)?);
        }
        Ok(evaluated)
    }
}
