//! Read/write conflict planning and lane assignment.
//!
//! Builds an explicit conflict `Graph` from each system's declared
//! read/write set, layers schedule directives and deny rules on top of the
//! inferred conflict edges, then diagnoses cycles and seals a topological
//! order before assigning lanes greedily.

use fxhash::FxHashMap;

use crate::component::ComponentTypeId;
use crate::error::{WorldError, WorldResult};
use crate::graph::{Graph, DEFAULT_LABEL};

/// Edge label for edges added by an explicit schedule directive, distinct
/// from `DEFAULT_LABEL`'s inferred read/write conflict edges so that denying
/// an inferred edge never also denies another system's directive edge.
const DIRECTIVE_LABEL: crate::graph::EdgeLabel = 1;

pub type SystemId = usize;

#[derive(Debug, Clone, Default)]
pub struct SystemAccess {
    pub reads: Vec<ComponentTypeId>,
    pub writes: Vec<ComponentTypeId>,
    /// Declared `onMainThread`: pins this system to lane 0.
    pub main_thread: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDirective {
    Before(SystemId),
    After(SystemId),
    BeforeReadersOf(ComponentTypeId),
    BeforeWritersOf(ComponentTypeId),
    /// Pins the declaring system to lane 0. Mirrored onto
    /// `SystemAccess::main_thread` by `SystemBuilder`, which is what
    /// `Planner::assign_lanes` actually reads.
    OnMainThread,
    /// Explicitly opts out of main-thread affinity (the default).
    OnManyThreads,
}

#[derive(Debug, Clone, Default)]
pub struct SystemDecl {
    pub name: String,
    pub access: SystemAccess,
    pub directives: Vec<ScheduleDirective>,
}

/// One row of the planned schedule: a system id and the lane it was
/// assigned to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedSystem {
    pub system: SystemId,
    pub lane: usize,
}

/// Builds the conflict graph from declared systems, diagnoses cycles, seals
/// a topological order, and greedily assigns lanes.
pub struct Planner {
    systems: Vec<SystemDecl>,
}

impl Planner {
    pub fn new() -> Self {
        Planner { systems: Vec::new() }
    }

    pub fn declare(&mut self, decl: SystemDecl) -> SystemId {
        self.systems.push(decl);
        self.systems.len() - 1
    }

    pub fn system(&self, id: SystemId) -> &SystemDecl {
        &self.systems[id]
    }

    fn conflicts(&self, a: &SystemAccess, b: &SystemAccess) -> bool {
        a.writes.iter().any(|t| b.writes.contains(t) || b.reads.contains(t))
            || a.reads.iter().any(|t| b.writes.contains(t))
    }

    /// Adds an edge for a directive declared by system `i` about system `j`
    /// (`i_before_j` picks the direction), denying the opposite direction's
    /// inferred conflict edge so the directive wins ("deny wins"). `local`
    /// tracks every target `i` has already issued a directive about within
    /// its own declaration; a second directive about the same `j` demanding
    /// the opposite order (e.g. `before(j)` followed by `after(j)`) is a
    /// direct self-contradiction and raises `ConflictingScheduleDirectives`.
    /// Two different systems independently declaring opposite orders is not
    /// a contradiction here — it is a genuine cycle, caught later by
    /// `find_cycles`.
    fn add_directive_edge(
        &self,
        g: &mut Graph,
        local: &mut FxHashMap<SystemId, bool>,
        i: SystemId,
        j: SystemId,
        i_before_j: bool,
    ) -> WorldResult<()> {
        if let Some(&prev) = local.get(&j) {
            if prev != i_before_j {
                return Err(WorldError::ConflictingScheduleDirectives {
                    a: self.systems[i].name.clone(),
                    b: self.systems[j].name.clone(),
                });
            }
        } else {
            local.insert(j, i_before_j);
        }

        let (from, to) = if i_before_j { (i, j) } else { (j, i) };
        g.deny_edge(to, from, DEFAULT_LABEL);
        g.add_edge(from, to, DIRECTIVE_LABEL);
        Ok(())
    }

    /// Builds the conflict graph: a read/write conflict between systems `i`
    /// and `j` (i < j) adds the edge in declaration order (`i -> j`), then
    /// schedule directives layer explicit edges on top, denying any inferred
    /// edge they contradict.
    fn build_conflict_graph(&self) -> WorldResult<Graph> {
        let n = self.systems.len();
        let mut g = Graph::new(n);

        for i in 0..n {
            for j in (i + 1)..n {
                if self.conflicts(&self.systems[i].access, &self.systems[j].access) {
                    g.add_edge(i, j, DEFAULT_LABEL);
                }
            }
        }

        for (i, decl) in self.systems.iter().enumerate() {
            let mut local: FxHashMap<SystemId, bool> = FxHashMap::default();
            for directive in &decl.directives {
                match *directive {
                    ScheduleDirective::Before(j) => {
                        if j >= n {
                            return Err(WorldError::UnknownSystemReferenced(format!("#{}", j)));
                        }
                        self.add_directive_edge(&mut g, &mut local, i, j, true)?;
                    }
                    ScheduleDirective::After(j) => {
                        if j >= n {
                            return Err(WorldError::UnknownSystemReferenced(format!("#{}", j)));
                        }
                        self.add_directive_edge(&mut g, &mut local, i, j, false)?;
                    }
                    ScheduleDirective::BeforeReadersOf(type_id) => {
                        for (j, other) in self.systems.iter().enumerate() {
                            if j != i && other.access.reads.contains(&type_id) {
                                self.add_directive_edge(&mut g, &mut local, i, j, true)?;
                            }
                        }
                    }
                    ScheduleDirective::BeforeWritersOf(type_id) => {
                        for (j, other) in self.systems.iter().enumerate() {
                            if j != i && other.access.writes.contains(&type_id) {
                                self.add_directive_edge(&mut g, &mut local, i, j, true)?;
                            }
                        }
                    }
                    ScheduleDirective::OnMainThread | ScheduleDirective::OnManyThreads => {}
                }
            }
        }

        Ok(g)
    }

    /// Builds, diagnoses, and seals the conflict graph, raising
    /// `CycleDetected` with the offending system names when a cycle survives
    /// directive application.
    pub fn plan(&self) -> WorldResult<(Graph, Vec<PlannedSystem>)> {
        let mut g = self.build_conflict_graph()?;

        let cycles = g.find_cycles();
        if let Some(cycle) = cycles.into_iter().next() {
            return Err(WorldError::CycleDetected {
                systems: cycle.into_iter().map(|i| self.systems[i].name.clone()).collect(),
            });
        }

        g.seal().map_err(|_| WorldError::internal("planner produced an unsealable graph"))?;
        let lanes = self.assign_lanes(&g)?;
        Ok((g, lanes))
    }

    /// Lane assignment: `onMainThread` systems are pinned to lane 0 (which
    /// runs serially regardless of conflicts, the same as a single thread
    /// always would); every other system is greedily packed into the
    /// lowest-numbered lane starting at 1 whose most recently scheduled
    /// system does not conflict with it, so lane 0 is never used unless a
    /// system actually requires it.
    fn assign_lanes(&self, g: &Graph) -> WorldResult<Vec<PlannedSystem>> {
        let order = g.topologically_sorted_vertices()?;
        let mut lane_heads: Vec<SystemId> = Vec::new();
        let mut planned = Vec::with_capacity(order.len());

        for &sys in order {
            if self.systems[sys].access.main_thread {
                planned.push(PlannedSystem { system: sys, lane: 0 });
                continue;
            }

            let mut chosen_lane = None;
            for (lane_idx, &head) in lane_heads.iter().enumerate() {
                if !self.conflicts(&self.systems[head].access, &self.systems[sys].access)
                    && !g.has_edge(sys, head)
                {
                    chosen_lane = Some(lane_idx);
                    break;
                }
            }
            let lane = match chosen_lane {
                Some(l) => {
                    lane_heads[l] = sys;
                    l + 1
                }
                None => {
                    lane_heads.push(sys);
                    lane_heads.len()
                }
            };
            planned.push(PlannedSystem { system: sys, lane });
        }

        Ok(planned)
    }

    pub fn read_write_map(&self) -> FxHashMap<ComponentTypeId, (Vec<SystemId>, Vec<SystemId>)> {
        let mut map: FxHashMap<ComponentTypeId, (Vec<SystemId>, Vec<SystemId>)> = FxHashMap::default();
        for (i, decl) in self.systems.iter().enumerate() {
            for &t in &decl.access.reads {
                map.entry(t).or_default().0.push(i);
            }
            for &t in &decl.access.writes {
                map.entry(t).or_default().1.push(i);
            }
        }
        map
    }
}

impl Default for Planner {
    fn default() -> Self {
        Planner::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, reads: &[ComponentTypeId], writes: &[ComponentTypeId]) -> SystemDecl {
        SystemDecl {
            name: name.to_string(),
            access: SystemAccess {
                reads: reads.to_vec(),
                writes: writes.to_vec(),
                main_thread: false,
            },
            directives: Vec::new(),
        }
    }

    #[test]
    fn independent_systems_share_a_lane() {
        let mut p = Planner::new();
        p.declare(decl("a", &[], &[0]));
        p.declare(decl("b", &[], &[1]));
        let (_, lanes) = p.plan().unwrap();
        assert_eq!(lanes.len(), 2);
        assert_eq!(lanes[0].lane, 1);
        assert_eq!(lanes[1].lane, 1);
    }

    #[test]
    fn main_thread_system_is_pinned_to_lane_zero() {
        let mut p = Planner::new();
        p.declare(SystemDecl {
            name: "ui".into(),
            access: SystemAccess {
                reads: vec![],
                writes: vec![0],
                main_thread: true,
            },
            directives: vec![ScheduleDirective::OnMainThread],
        });
        p.declare(decl("physics", &[], &[1]));
        let (_, lanes) = p.plan().unwrap();
        assert_eq!(lanes[0].lane, 0);
        assert_eq!(lanes[1].lane, 1);
    }

    #[test]
    fn contradictory_before_after_directives_are_rejected() {
        let mut p = Planner::new();
        p.declare(SystemDecl {
            name: "a".into(),
            access: SystemAccess::default(),
            directives: vec![ScheduleDirective::Before(1), ScheduleDirective::After(1)],
        });
        p.declare(decl("b", &[], &[]));
        let err = p.plan().unwrap_err();
        assert!(matches!(err, WorldError::ConflictingScheduleDirectives { .. }));
    }

    #[test]
    fn directive_overrides_inferred_conflict_edge() {
        let mut p = Planner::new();
        let a = p.declare(decl("a", &[], &[0]));
        let b = p.declare(decl("b", &[], &[0]));
        // a and b both write component 0, inferring a -> b; After(b) on a
        // explicitly requires the opposite order, which must win.
        p.systems[a].directives.push(ScheduleDirective::After(b));
        let (g, lanes) = p.plan().unwrap();
        assert!(g.has_edge(b, a));
        assert!(!g.has_edge(a, b));
        assert_ne!(lanes[0].lane, 0);
        assert_ne!(lanes[1].lane, 0);
    }

    #[test]
    fn conflicting_writers_are_ordered_and_lane_separated() {
        let mut p = Planner::new();
        p.declare(decl("a", &[], &[0]));
        p.declare(decl("b", &[], &[0]));
        let (g, lanes) = p.plan().unwrap();
        assert!(g.has_edge(0, 1));
        assert_ne!(lanes[0].lane, lanes[1].lane);
    }

    #[test]
    fn cycle_from_directives_is_reported_by_name() {
        let mut p = Planner::new();
        p.declare(SystemDecl {
            name: "a".into(),
            access: SystemAccess::default(),
            directives: vec![ScheduleDirective::After(1)],
        });
        p.declare(SystemDecl {
            name: "b".into(),
            access: SystemAccess::default(),
            directives: vec![ScheduleDirective::After(0)],
        });
        let err = p.plan().unwrap_err();
        match err {
            WorldError::CycleDetected { systems } => {
                assert_eq!(systems.len(), 2);
            }
            other => panic!("expected CycleDetected, got {:?}", other),
        }
    }
}
