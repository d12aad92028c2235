//! Compiled descriptor programs
//!
//! A program is the ordered list of activations the matrix engine runs for
//! one operation. Each activation carries one descriptor per core.

use serde::{Deserialize, Serialize};

use crate::agu::MmeAguConfig;
use crate::chip::{ChipGen, MmeDescriptor};
use crate::error::DescResult;
use crate::geometry::Strategy;
use crate::params::OpType;
use crate::recipe::Recipe;

/// Target of a compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub chip: ChipGen,
    pub strategy: Strategy,
}

impl TargetConfig {
    pub fn new(chip: ChipGen, strategy: Strategy) -> Self {
        Self { chip, strategy }
    }
}

/// What an activation does to its output view
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActivationKind {
    /// Zero-fills the output view
    Memset,
    /// Overwrites the output view with its result
    Compute,
    /// Adds its result to the output view
    Accumulate,
}

/// One activation of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub id: usize,
    /// Ordering key of the sub-problem it belongs to
    pub sub_problem: usize,
    pub description: String,
    pub kind: ActivationKind,
    pub recipe: Recipe,
    pub agu: MmeAguConfig,
    pub descriptors: Vec<MmeDescriptor>,
}

/// A complete descriptor program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorProgram {
    pub target: TargetConfig,
    pub op: OpType,
    pub activations: Vec<Activation>,
    pub num_sub_problems: usize,
    pub total_descriptors: usize,
    /// Human-readable summary
    pub summary: String,
}

impl DescriptorProgram {
    pub fn new(target: TargetConfig, op: OpType) -> Self {
        Self {
            target,
            op,
            activations: Vec::new(),
            num_sub_problems: 0,
            total_descriptors: 0,
            summary: String::new(),
        }
    }

    pub fn add_activation(&mut self, activation: Activation) {
        self.total_descriptors += activation.descriptors.len();
        self.activations.push(activation);
    }

    pub fn count(&self, kind: ActivationKind) -> usize {
        self.activations.iter().filter(|a| a.kind == kind).count()
    }

    pub fn generate_summary(&mut self) {
        let geo = &self.target.strategy.geometry;
        self.summary = format!(
            "Descriptor Program Summary:\n\
             ===========================\n\
             Target: {} ({} unit(s), {} core(s), {}x{} ports of {}x{})\n\
             Operation: {}\n\
             Sub-problems: {}\n\
             Activations: {} ({} memset, {} compute, {} accumulate)\n\
             Descriptors: {}\n",
            self.target.chip,
            geo.num_mmes(),
            geo.num_cores(),
            geo.fcd_ports,
            geo.sp_ports,
            geo.port_width,
            geo.port_height,
            self.op,
            self.num_sub_problems,
            self.activations.len(),
            self.count(ActivationKind::Memset),
            self.count(ActivationKind::Compute),
            self.count(ActivationKind::Accumulate),
            self.total_descriptors
        );
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Encoded descriptors, one line of 32-bit words per descriptor
    pub fn to_hex_dump(&self) -> DescResult<String> {
        let mut output = String::new();
        output.push_str(&format!(
            "// {} descriptors for {} ({} activation(s))\n",
            self.target.chip,
            self.op,
            self.activations.len()
        ));
        for activation in &self.activations {
            output.push_str(&format!("// activation {}: {}\n", activation.id, activation.description));
            for desc in &activation.descriptors {
                let words = desc.encode()?;
                output.push_str(&format!("core{:02}:", desc.core));
                for word in words {
                    output.push_str(&format!(" {:08x}", word));
                }
                output.push('\n');
            }
        }
        Ok(output)
    }
}

impl std::fmt::Display for DescriptorProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Descriptor Program")?;
        writeln!(f, "==================")?;
        writeln!(f, "Target: {}", self.target.chip)?;
        writeln!(f, "Operation: {}", self.op)?;
        writeln!(f, "Pattern: {}", self.target.strategy.pattern)?;
        writeln!(f, "Sub-problems: {}", self.num_sub_problems)?;
        writeln!(f, "Activations: {}", self.activations.len())?;
        writeln!(f, "Descriptors: {}", self.total_descriptors)?;
        writeln!(f)?;

        for activation in &self.activations {
            let r = &activation.recipe;
            writeln!(f, "Activation {}:", activation.id)?;
            writeln!(f, "  Description: {}", activation.description)?;
            writeln!(f, "  Kind: {:?}", activation.kind)?;
            writeln!(f, "  Rows: [{}, +{})", r.sp.base, r.sp.size)?;
            writeln!(f, "  Dense: [{}, +{})", r.fcd.base, r.fcd.size)?;
            writeln!(f, "  Common dim: [{}, +{}) padded to {}", r.cd.base, r.cd.size, activation.agu.padded_cd)?;
            writeln!(f, "  Loop iterations: {}", activation.agu.loops.iterations())?;
            writeln!(f)?;
        }

        Ok(())
    }
}
