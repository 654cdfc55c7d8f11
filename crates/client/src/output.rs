//! Human-readable rendering for CLI results. `--json` bypasses all of this.

use portkeeper::{
    Dashboard, Group, GroupAllocation, KillReport, Occupancy, PortAllocation, Reservation,
};

fn describe(allocation: &PortAllocation) -> String {
    let mut parts: Vec<String> = allocation
        .allocation
        .metadata
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    if let Some(label) = &allocation.allocation.label {
        parts.push(format!("label={}", label));
    }
    if let Some(pid) = allocation.allocation.pid {
        parts.push(format!("pid={}", pid));
    }
    parts.join(" ")
}

pub fn print_allocations(allocations: &[PortAllocation]) {
    if allocations.is_empty() {
        println!("No allocations");
        return;
    }
    println!("Allocations:");
    for allocation in allocations {
        println!(
            "Port: {}, Since: {}, {}",
            allocation.port,
            allocation.allocation.allocated_at.format("%Y-%m-%d %H:%M:%S"),
            describe(allocation)
        );
    }
}

pub fn print_group_allocation(group: &GroupAllocation) {
    println!("Group: {}", group.group_id);
    for (role, port) in &group.ports {
        println!("  {}: {}", role, port);
    }
}

pub fn print_groups(groups: &[Group]) {
    if groups.is_empty() {
        println!("No groups");
        return;
    }
    for group in groups {
        println!("Group: {}", group.group_id);
        for member in &group.members {
            println!("  {}: {}", member.role.as_deref().unwrap_or("-"), member.port);
        }
    }
}

pub fn print_dashboard(dashboard: &Dashboard) {
    if dashboard.is_empty() {
        println!("No allocations");
        return;
    }
    for (app, worktrees) in dashboard {
        println!("{}", app);
        for (worktree, entries) in worktrees {
            println!("  {}", worktree);
            for entry in entries {
                let status = if entry.in_use { "listening" } else { "idle" };
                let service = entry
                    .allocation
                    .metadata
                    .get("service")
                    .map(String::as_str)
                    .unwrap_or("-");
                println!("    {:<6} {:<10} {}", entry.port, status, service);
            }
        }
    }
}

pub fn print_reservation(reservation: &Reservation) {
    match (&reservation.occupier, reservation.killed) {
        (Some(occupier), true) => println!(
            "Reserved port {} (terminated {} pid {})",
            reservation.port, occupier.process_name, occupier.pid
        ),
        _ => println!("Reserved port {}", reservation.port),
    }
}

pub fn print_occupancy(port: u16, occupancy: &Occupancy) {
    match occupancy {
        Occupancy::Free => println!("Port {} is free", port),
        Occupancy::OccupiedBy(occupier) => println!(
            "Port {} is held by {} (pid {})",
            port, occupier.process_name, occupier.pid
        ),
        Occupancy::InspectionFailed { reason } => {
            println!("Port {} could not be inspected: {}", port, reason)
        }
    }
}

pub fn print_kill_report(port: u16, report: &KillReport) {
    if report.killed {
        println!(
            "Terminated {} (pid {}) on port {}",
            report.process_name.as_deref().unwrap_or("process"),
            report.pid.unwrap_or_default(),
            port
        );
    } else {
        println!(
            "Nothing terminated on port {}: {}",
            port,
            report.reason.as_deref().unwrap_or("no listener")
        );
    }
}
