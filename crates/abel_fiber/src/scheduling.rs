// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashSet;

use many_cpus::SystemHardware;

/// No scheduling group grows beyond this many workers; past that point the
/// shared run queue becomes the bottleneck.
const MAX_SCHEDULING_GROUP_SIZE: usize = 64;

/// The broad workload shape the runtime is asked to optimize for.
///
/// Compute-flavored profiles prefer large groups (fewer, wider steal pools);
/// I/O-flavored profiles prefer small groups (lower wake-up latency, less
/// queue contention from frequent suspensions).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SchedulingProfile {
    /// Long-running CPU-bound work; groups as large as the cap allows.
    ComputeHeavy,
    /// Mostly CPU-bound; NUMA-partitioned when the machine is busy enough.
    Compute,
    /// Mixed workload; group size searched in [16, 32).
    Neutral,
    /// Mostly I/O; group size searched in [12, 24).
    Io,
    /// I/O-dominated; group size searched in [8, 16).
    IoHeavy,
}

/// How many scheduling groups to create, how many workers each owns, and
/// whether groups are pinned to NUMA nodes. Computed once per runtime
/// instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchedulingParameters {
    pub scheduling_groups: usize,
    pub workers_per_group: usize,
    pub enable_numa_affinity: bool,
}

impl SchedulingParameters {
    /// Derives parameters from the current machine's topology.
    ///
    /// # Panics
    ///
    /// Panics if the processor topology cannot be read.
    #[must_use]
    pub fn for_this_machine(profile: SchedulingProfile, desired_concurrency: usize) -> Self {
        let processors = SystemHardware::current().all_processors();

        let mut available = 0;
        let mut domains = HashSet::new();
        for processor in &processors {
            available += 1;
            let _ = domains.insert(processor.memory_region_id());
        }

        scheduling_parameters(profile, domains.len().max(1), available, desired_concurrency)
    }
}

/// Derives scheduling parameters from a profile and an explicit topology:
/// NUMA-domain count, available-processor count and desired concurrency.
#[must_use]
pub fn scheduling_parameters(
    profile: SchedulingProfile,
    numa_domains: usize,
    available_processors: usize,
    desired_concurrency: usize,
) -> SchedulingParameters {
    match profile {
        SchedulingProfile::ComputeHeavy => compute_heavy(desired_concurrency),
        SchedulingProfile::Compute => compute_numa(numa_domains, available_processors, desired_concurrency),
        SchedulingProfile::Neutral => of_group_size(numa_domains, desired_concurrency, 16, 32),
        SchedulingProfile::Io => of_group_size(numa_domains, desired_concurrency, 12, 24),
        SchedulingProfile::IoHeavy => of_group_size(numa_domains, desired_concurrency, 8, 16),
    }
}

fn compute_heavy(concurrency: usize) -> SchedulingParameters {
    let groups = concurrency.div_ceil(MAX_SCHEDULING_GROUP_SIZE).max(1);

    SchedulingParameters {
        scheduling_groups: groups,
        workers_per_group: concurrency.div_ceil(groups),
        enable_numa_affinity: false,
    }
}

fn compute_numa(numa_domains: usize, available_processors: usize, desired_concurrency: usize) -> SchedulingParameters {
    // Partitioning by node only pays off when the workload occupies a
    // meaningful share of the machine.
    let numa_aware = numa_domains > 1 && desired_concurrency * 2 >= available_processors;
    if !numa_aware {
        return compute_heavy(desired_concurrency);
    }

    let per_node = desired_concurrency.div_ceil(numa_domains);
    let groups_per_node = per_node.div_ceil(MAX_SCHEDULING_GROUP_SIZE);

    SchedulingParameters {
        scheduling_groups: groups_per_node * numa_domains,
        workers_per_group: per_node.div_ceil(groups_per_node),
        enable_numa_affinity: true,
    }
}

/// Searches the profile's half-open group-size range for the size wasting
/// the fewest idle workers, preferring a NUMA-divisible configuration when
/// its waste stays within a tenth of the concurrency.
fn of_group_size(numa_domains: usize, concurrency: usize, group_size_low: usize, group_size_high: usize) -> SchedulingParameters {
    if concurrency <= group_size_low {
        return SchedulingParameters {
            scheduling_groups: 1,
            workers_per_group: concurrency,
            enable_numa_affinity: false,
        };
    }

    let mut numa_aware = true;
    let mut best_group_size = 0;
    let mut best_extra_workers = usize::MAX;

    // Try to respect the NUMA topology first.
    if numa_domains > 1 {
        for size in group_size_low..group_size_high {
            let groups = concurrency.div_ceil(size);
            if groups % numa_domains != 0 {
                continue;
            }
            let extra = groups * size - concurrency;
            if extra < best_extra_workers {
                best_extra_workers = extra;
                best_group_size = size;
            }
        }
    }

    // If no configuration fits the NUMA topology well enough, retry with a
    // UMA configuration.
    if best_group_size == 0 || best_extra_workers > concurrency / 10 {
        numa_aware = false;
        best_extra_workers = usize::MAX;
        for size in group_size_low..group_size_high {
            let groups = concurrency.div_ceil(size);
            let extra = groups * size - concurrency;
            if extra < best_extra_workers {
                best_extra_workers = extra;
                best_group_size = size;
            }
        }
    }

    SchedulingParameters {
        scheduling_groups: concurrency.div_ceil(best_group_size),
        workers_per_group: best_group_size,
        enable_numa_affinity: numa_aware,
    }
}
