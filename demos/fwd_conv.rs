//! Forward convolution on a small multi-core geometry
//!
//! Run with: cargo run --example fwd_conv

use mme_desc::{compile, ChipGen, ConvParams, DataType, Geometry, Interleave, Operation, Strategy, Tensor};

fn main() {
    // 16 input channels, 14x14 image, batch 2; 32 filters of 3x3, padding 1
    let x = Tensor::dense(&[16, 14, 14, 1, 2], DataType::Bf16);
    let w = Tensor::dense(&[32, 16, 3, 3, 1], DataType::Bf16);
    let y = Tensor::dense(&[32, 14, 14, 1, 2], DataType::Bf16);
    let conv = ConvParams::new([1, 1, 1], [1, 1, 1], [1, 1, 0]);
    let op = Operation::fwd(x, w, y, conv);

    let geometry = Geometry {
        mmes_w: 1,
        mmes_h: 2,
        cores_w: 1,
        cores_h: 2,
        fcd_ports: 2,
        sp_ports: 2,
        port_width: 16,
        port_height: 32,
    };
    let strategy = Strategy::new(geometry).with_interleave(Interleave {
        across_mmes: true,
        across_cores: false,
        inside_core: false,
    });

    match compile(&op, &strategy, ChipGen::Gen3) {
        Ok(program) => {
            println!("{}", program.summary);
            if let Some(first) = program.activations.first() {
                println!("First activation: {}", first.description);
                for desc in &first.descriptors {
                    let valid = desc.agu.c.iter().filter(|p| p.is_valid()).count();
                    println!("  core {}: {} valid output port(s)", desc.core, valid);
                }
            }
        }
        Err(e) => eprintln!("Error: {}", e),
    }
}
