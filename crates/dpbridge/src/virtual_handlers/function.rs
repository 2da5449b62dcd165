use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use tracing::warn;

use super::descriptor::DescriptorRegistry;
use super::descriptor::EntityDescriptor;
use super::descriptor::VirtualFunction;
use crate::device::Device;
use crate::source::Command;

/// A command aimed at a virtual function, paired with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualCommand {
    pub code: String,
    pub value: Value,
    pub descriptor: EntityDescriptor,
}

/// What executing virtual commands produced.
#[derive(Debug, Default, PartialEq)]
pub struct VirtualFunctionOutcome {
    /// Regular commands to send to the device.
    pub commands: Vec<Command>,

    /// Status codes reset locally.
    pub reset_codes: Vec<String>,
}

/// Executes commands locally that the device does not implement itself.
pub struct VirtualFunctionHandler {
    registry: Arc<DescriptorRegistry>,
}

impl VirtualFunctionHandler {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self { registry }
    }

    pub fn get_category_virtual_functions(&self, category: &str) -> Vec<EntityDescriptor> {
        self.registry.category_descriptors(category, |descriptor| {
            !descriptor.virtual_function.is_empty()
        })
    }

    /// Find the virtual function a command code addresses, either by its
    /// key or as one of the codes it resets.
    pub fn find_virtual_function<'a>(
        descriptors: &'a [EntityDescriptor],
        code: &str,
    ) -> Option<&'a EntityDescriptor> {
        descriptors
            .iter()
            .find(|d| d.key == code || d.vf_reset_state.iter().any(|reset| reset == code))
    }

    pub fn process_virtual_function(
        &self,
        device: &Device,
        commands: &[VirtualCommand],
    ) -> VirtualFunctionOutcome {
        let mut outcome = VirtualFunctionOutcome::default();

        for command in commands {
            let descriptor = &command.descriptor;

            if descriptor.virtual_function.contains(VirtualFunction::ResetState) {
                let mut status = device.status.lock();
                for code in &descriptor.vf_reset_state {
                    let Some(value) = status.get_mut(code) else {
                        debug!("{}: nothing to reset for {}", device.id, code);
                        continue;
                    };
                    *value = reset_value(value);
                    if !outcome.reset_codes.contains(code) {
                        outcome.reset_codes.push(code.clone());
                    }
                }
            }

            if descriptor.virtual_function.contains(VirtualFunction::ForwardToCode) {
                match &descriptor.vf_forward_to_code {
                    Some(target) => outcome
                        .commands
                        .push(Command::new(target.clone(), command.value.clone())),
                    None => warn!(
                        "{}: {} forwards without a target code",
                        device.id, descriptor.key
                    ),
                }
            }
        }

        outcome
    }
}

/// Reset value of the same JSON type as `value`.
fn reset_value(value: &Value) -> Value {
    match value {
        Value::Number(number) if number.is_f64() => Value::from(0.0),
        Value::Number(_) => Value::from(0),
        Value::Bool(_) => Value::Bool(false),
        Value::String(_) => Value::String(String::new()),
        _ => Value::Null,
    }
}
