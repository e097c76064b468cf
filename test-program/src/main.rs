//! Dumps the unwind tables of an object file.
//!
//! ```text
//! test-program <object file> [pc in hex...]
//! ```
//!
//! Without arguments, a small built-in `.debug_frame` is used.

use anyhow::Context;
use object::{Object, ObjectSection};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uwutables::arch::{AArch64, RegisterNames, X86, X86_64};
use uwutables::{Endian, ParseOptions, SectionKind, UnwindTable};

/// One function with a `push rbp; mov rbp, rsp` prologue at 0x400c00.
#[rustfmt::skip]
const SAMPLE: &[u8] = &[
    // CIE: v3, caf 1, daf -4, ra 16, def_cfa rsp+8, offset rip
    0x10, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 3, 0, 1, 0x7c, 0x10,
    0x0c, 7, 8, 0x90, 2, 0, 0,
    // FDE: pc=400c00...400c20
    0x1c, 0, 0, 0, 0, 0, 0, 0,
    0x00, 0x0c, 0x40, 0, 0, 0, 0, 0, 0x20, 0, 0, 0, 0, 0, 0, 0,
    0x41, 0x0e, 0x10, 0x86, 0x04, 0x43, 0x0d, 0x06,
];

fn main() -> anyhow::Result<()> {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()?,
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        let table = UnwindTable::parse(SAMPLE, ParseOptions::debug_frame(8, Endian::Little))?;
        dump(&table, &X86_64);
        for pc in [0x400c02, 0x400c10, 0x400c20] {
            resolve(&table, &X86_64, pc);
        }
        return Ok(());
    };
    let pcs = args
        .map(|pc| u64::from_str_radix(pc.trim_start_matches("0x"), 16))
        .collect::<Result<Vec<_>, _>>()
        .context("pcs must be hex numbers")?;

    let data = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
    let file = object::File::parse(&*data)?;
    let names: &dyn RegisterNames = match file.architecture() {
        object::Architecture::X86_64 => &X86_64,
        object::Architecture::I386 => &X86,
        object::Architecture::Aarch64 => &AArch64,
        _ => &(),
    };
    let endian = if file.is_little_endian() {
        Endian::Little
    } else {
        Endian::Big
    };
    let address_size = if file.is_64() { 8 } else { 4 };

    for kind in [SectionKind::EhFrame, SectionKind::DebugFrame] {
        let Some(section) = file.section_by_name(kind.section_name()) else {
            continue;
        };
        let options = match kind {
            SectionKind::EhFrame => ParseOptions::eh_frame(address_size, endian, section.address()),
            SectionKind::DebugFrame => ParseOptions::debug_frame(address_size, endian),
        };
        let table = UnwindTable::parse(section.data()?, options)
            .with_context(|| format!("building the table of {}", kind.section_name()))?;
        tracing::info!(section = kind.section_name(), fdes = table.len(), "parsed");

        dump(&table, names);
        for &pc in &pcs {
            resolve(&table, names, pc);
        }
    }
    Ok(())
}

fn dump(table: &UnwindTable<'_>, names: &dyn RegisterNames) {
    for fde in table.fdes() {
        println!(
            "FDE {:08x} cie={:08x} pc={:08x}...{:08x}",
            fde.fde_offset(),
            fde.cie_offset(),
            fde.start(),
            fde.end()
        );
        for row in fde.rows() {
            println!("  {}", row.display(names));
        }
    }
}

fn resolve(table: &UnwindTable<'_>, names: &dyn RegisterNames, pc: u64) {
    match table.resolve(pc) {
        Ok(row) => println!("{pc:#x}: {}", row.display(names)),
        Err(err) => tracing::warn!("{pc:#x}: {err}"),
    }
}
