use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Application;

pub type InstanceId = u64;

/// Commands understood by the stack calculator.
///
/// Binary operations pop the top two operands (`a` the top, `b` beneath it)
/// and push `a op b` back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalcCommand {
    /// Allocate a fresh calculator instance; the result value is its id
    Create,
    Delete { instance: InstanceId },
    Push { instance: InstanceId, operand: i64 },
    Pop { instance: InstanceId },
    Add { instance: InstanceId },
    Sub { instance: InstanceId },
    Mul { instance: InstanceId },
    Div { instance: InstanceId },
    Inc { instance: InstanceId },
    Dec { instance: InstanceId },
    /// Peek at the top of the stack without popping
    Get { instance: InstanceId },
}

/// Outcome of a calculator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcResult {
    pub success: bool,
    pub value: i64,
}

impl CalcResult {
    fn ok(value: i64) -> Self {
        Self {
            success: true,
            value,
        }
    }

    fn fail() -> Self {
        Self {
            success: false,
            value: 0,
        }
    }

    fn from_value(value: Option<i64>) -> Self {
        match value {
            Some(v) => Self::ok(v),
            None => Self::fail(),
        }
    }
}

/// A deterministic stack-calculator state machine: independent stack
/// instances keyed by id, allocated by `Create`.
#[derive(Debug, Default)]
pub struct Calculator {
    stacks: HashMap<InstanceId, Vec<i64>>,
    last_instance_id: InstanceId,
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(&mut self) -> InstanceId {
        self.last_instance_id += 1;
        self.stacks.insert(self.last_instance_id, Vec::new());
        self.last_instance_id
    }

    fn delete(&mut self, instance: InstanceId) -> bool {
        self.stacks.remove(&instance).is_some()
    }

    fn push(&mut self, instance: InstanceId, operand: i64) -> bool {
        match self.stacks.get_mut(&instance) {
            Some(stack) => {
                stack.push(operand);
                true
            }
            None => false,
        }
    }

    fn pop(&mut self, instance: InstanceId) -> Option<i64> {
        self.stacks.get_mut(&instance)?.pop()
    }

    fn peek(&self, instance: InstanceId) -> Option<i64> {
        self.stacks.get(&instance)?.last().copied()
    }

    fn binary_op(&mut self, instance: InstanceId, op: fn(i64, i64) -> i64) -> Option<i64> {
        let stack = self.stacks.get_mut(&instance)?;
        if stack.len() < 2 {
            return None;
        }
        let a = stack.pop()?;
        let b = stack.pop()?;
        let value = op(a, b);
        stack.push(value);
        Some(value)
    }

    fn div(&mut self, instance: InstanceId) -> Option<i64> {
        let stack = self.stacks.get_mut(&instance)?;
        if stack.len() < 2 {
            return None;
        }
        let a = stack.pop()?;
        let b = stack.pop()?;
        if b == 0 {
            // Restore the operands, divisor first, so the stack is exactly
            // as it was before the failed division.
            stack.push(b);
            stack.push(a);
            return None;
        }
        let value = a / b;
        stack.push(value);
        Some(value)
    }

    fn unary_op(&mut self, instance: InstanceId, delta: i64) -> Option<i64> {
        let stack = self.stacks.get_mut(&instance)?;
        let value = stack.pop()? + delta;
        stack.push(value);
        Some(value)
    }
}

impl Application for Calculator {
    type Command = CalcCommand;
    type Output = CalcResult;

    fn apply_command(&mut self, command: CalcCommand) -> CalcResult {
        match command {
            CalcCommand::Create => CalcResult::ok(self.create() as i64),
            CalcCommand::Delete { instance } => {
                if self.delete(instance) {
                    CalcResult::ok(0)
                } else {
                    CalcResult::fail()
                }
            }
            CalcCommand::Push { instance, operand } => {
                if self.push(instance, operand) {
                    CalcResult::ok(0)
                } else {
                    CalcResult::fail()
                }
            }
            CalcCommand::Pop { instance } => CalcResult::from_value(self.pop(instance)),
            CalcCommand::Add { instance } => {
                CalcResult::from_value(self.binary_op(instance, |a, b| a + b))
            }
            CalcCommand::Sub { instance } => {
                CalcResult::from_value(self.binary_op(instance, |a, b| a - b))
            }
            CalcCommand::Mul { instance } => {
                CalcResult::from_value(self.binary_op(instance, |a, b| a * b))
            }
            CalcCommand::Div { instance } => CalcResult::from_value(self.div(instance)),
            CalcCommand::Inc { instance } => CalcResult::from_value(self.unary_op(instance, 1)),
            CalcCommand::Dec { instance } => CalcResult::from_value(self.unary_op(instance, -1)),
            CalcCommand::Get { instance } => CalcResult::from_value(self.peek(instance)),
        }
    }
}
