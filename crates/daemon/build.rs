// SPDX-License-Identifier: MIT

//! Cross-compiles `traffic-limitd-ebpf` for `bpfel-unknown-none` and embeds
//! the result so `ebpf_loader` can `include_bytes_aligned!` it at runtime.

fn main() -> anyhow::Result<()> {
    let cargo_metadata::Metadata { packages, .. } =
        cargo_metadata::MetadataCommand::new().no_deps().exec()?;
    let ebpf_package = packages
        .into_iter()
        .find(|cargo_metadata::Package { name, .. }| name == "traffic-limitd-ebpf")
        .ok_or_else(|| anyhow::anyhow!("traffic-limitd-ebpf package not found in workspace metadata"))?;
    aya_build::build_ebpf([ebpf_package])?;
    Ok(())
}
