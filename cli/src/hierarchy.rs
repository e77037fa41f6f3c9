use vcd::{ScopeId, Vcd};

pub fn print_summary(vcd: &Vcd) {
    if let Some(filename) = &vcd.filename {
        println!("File:       {}", filename.display());
    }
    match (&vcd.timescale, vcd.timescale_fs()) {
        (Some(timescale), Some(fs)) => println!("Timescale:  {timescale} ({fs} fs)"),
        (Some(timescale), None) => println!("Timescale:  {timescale}"),
        (None, _) => println!("Timescale:  none"),
    }
    println!("Signals:    {}", vcd.signals.len());
    println!("Scopes:     {}", vcd.hierarchy.len() - 1);
    match (vcd.times.as_slice().first(), vcd.times.last()) {
        (Some(first), Some(last)) => {
            println!("Times:      {} from #{first} to #{last}", vcd.times.len())
        }
        _ => println!("Times:      none"),
    }
    println!(
        "Bytes:      header {}, read up to {}",
        vcd.definition_end, vcd.committed_end
    );
}

/// Print the scope tree with the signals in each scope, and optionally all of
/// their changes.
pub fn print_hierarchy(vcd: &Vcd, show_changes: bool) {
    for (scope_id, depth) in vcd.hierarchy.walk() {
        let scope = &vcd.hierarchy[scope_id];
        let indent = "  ".repeat(depth);
        println!("{indent}{}", scope.name);

        for &signal_id in &scope.signals {
            let signal = &vcd.signals[signal_id];
            // An alias declared here of a signal first declared elsewhere.
            let alias = if signal.scope != scope_id {
                format!(" (alias of {})", qualified_name(vcd, signal.scope, &signal.name))
            } else {
                String::new()
            };
            println!(
                "{indent}  {} {} {} [{}]: {} changes{alias}",
                signal.kind,
                signal.width,
                signal.name,
                signal.code,
                signal.changes.len()
            );

            if show_changes {
                for (time, value) in signal.timed_changes(&vcd.times) {
                    println!("{indent}    #{time} {value}");
                }
            }
        }
    }
}

fn qualified_name(vcd: &Vcd, scope: ScopeId, name: &str) -> String {
    let path = vcd.hierarchy.path(scope);
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}.{name}")
    }
}
