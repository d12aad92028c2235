//! Input gradient of a stride-2 convolution
//!
//! The gradient splits into one sub-problem per output residue class.
//!
//! Run with: cargo run --example dedx_strided

use mme_desc::{
    ChipGen, CodeGenerator, ConvParams, DataType, Geometry, Operation, Strategy, TargetConfig, Tensor,
};

fn main() {
    // 1x1 filters at stride 2 never reach odd rows or columns of dx
    let dy = Tensor::dense(&[4, 4, 4, 1, 1], DataType::Fp32);
    let w = Tensor::dense(&[4, 8, 1, 1, 1], DataType::Fp32);
    let dx = Tensor::dense(&[8, 7, 7, 1, 1], DataType::Fp32);
    let conv = ConvParams::new([2, 2, 1], [1, 1, 1], [0, 0, 0]);
    let op = Operation::dedx(dy, w, dx, conv);

    for opt in [false, true] {
        let mut strategy = Strategy::new(Geometry::single(8, 32));
        strategy.recurring_misalignment_opt = opt;
        let mut codegen = CodeGenerator::new(TargetConfig::new(ChipGen::Gen2, strategy));
        match codegen.generate(&op) {
            Ok(program) => {
                println!("recurring misalignment optimization: {}", opt);
                for activation in &program.activations {
                    println!("  {}", activation.description);
                }
                println!();
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }
}
