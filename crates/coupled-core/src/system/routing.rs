//! Routing-table construction and validation for systems.
//!
//! Every inner-component input variable is matched by name against the
//! system's external inputs (`argin`) and the other components' outputs. The
//! resulting table maps each input slice to its source slice; it is computed
//! once at build time and drives both value gathering and Jacobian
//! accumulation.

use petgraph::algo::is_cyclic_directed;
use petgraph::Graph;
use std::collections::HashMap;

use crate::errors::{CoupledError, CoupledResult};
use crate::variable::{check_unique, VarLayout, Variable};

/// Name, inputs and outputs of one inner component, as seen by the router.
pub(crate) struct ComponentIo<'a> {
    pub name: &'a str,
    pub in_vars: &'a [Variable],
    pub out_vars: &'a [Variable],
}

/// Where an input slice comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceRef {
    /// Offset into the system's flat input vector.
    Argin { offset: usize },
    /// Offset into inner component `index`'s flat output vector.
    Component { index: usize, offset: usize },
}

/// One routed input slice of an inner component.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Route {
    /// Offset within the consumer's flat input vector.
    pub dst_offset: usize,
    pub size: usize,
    pub src: SourceRef,
}

/// Source of one declared system output.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArgoutSource {
    pub component: usize,
    /// Offset within the producer's flat output vector.
    pub offset: usize,
    pub size: usize,
    /// Offset within the system's flat output vector.
    pub dst_offset: usize,
}

/// The complete routing of a system: a total function on inner inputs.
#[derive(Debug)]
pub(crate) struct Routing {
    /// Routes per inner component, in input declaration order.
    pub routes: Vec<Vec<Route>>,
    /// Offset of each component's output block in the published vector.
    pub out_offsets: Vec<usize>,
    /// Total width of the published vector (Σ inner output widths).
    pub total_out: usize,
    /// Sources of the declared system outputs (explicit systems only).
    pub argout: Vec<ArgoutSource>,
}

struct Producer {
    component: usize,
    offset: usize,
    size: usize,
}

/// Build and validate the routing table.
///
/// With `ordered` set (explicit systems), an input may only be sourced from a
/// component that was declared earlier; the most recent earlier producer wins
/// when several components publish the same name, mirroring how a later
/// producer overrides an earlier one for downstream consumers. An input whose
/// only producers come later fails with [`CoupledError::Cycle`]. Without
/// `ordered` (implicit systems), any member's output is a legal source and
/// output names must be globally unique.
pub(crate) fn build_routing(
    components: &[ComponentIo<'_>],
    argin: &[Variable],
    argout: Option<&[Variable]>,
    ordered: bool,
) -> CoupledResult<Routing> {
    check_unique(argin)?;
    if let Some(argout) = argout {
        check_unique(argout)?;
    }

    let argin_layout = VarLayout::new(argin);
    let mut argin_spans: HashMap<&str, (usize, usize)> = HashMap::new();
    for (i, var) in argin.iter().enumerate() {
        let span = argin_layout.span(i);
        argin_spans.insert(var.name(), (span.offset, span.size));
    }

    // Every producer of every name, in declaration order.
    let mut producers: HashMap<&str, Vec<Producer>> = HashMap::new();
    let mut out_offsets = Vec::with_capacity(components.len());
    let mut total_out = 0;
    for (k, comp) in components.iter().enumerate() {
        out_offsets.push(total_out);
        let layout = VarLayout::new(comp.out_vars);
        for (i, var) in comp.out_vars.iter().enumerate() {
            let span = layout.span(i);
            producers.entry(var.name()).or_default().push(Producer {
                component: k,
                offset: span.offset,
                size: span.size,
            });
        }
        total_out += layout.width();
    }

    if !ordered {
        // Implicit systems concatenate every member's outputs into one state
        // vector, so output names must not collide.
        let all_out: Vec<Variable> = components
            .iter()
            .flat_map(|c| c.out_vars.iter().cloned())
            .collect();
        check_unique(&all_out)?;
    }

    // Dependency graph over components for cycle diagnosis.
    let mut graph: Graph<usize, ()> = Graph::new();
    let nodes: Vec<_> = (0..components.len()).map(|k| graph.add_node(k)).collect();
    for (k, comp) in components.iter().enumerate() {
        for var in comp.in_vars {
            if let Some(list) = producers.get(var.name()) {
                for producer in list {
                    graph.add_edge(nodes[producer.component], nodes[k], ());
                }
            }
        }
    }

    let mut routes = Vec::with_capacity(components.len());
    for (k, comp) in components.iter().enumerate() {
        check_unique(comp.in_vars)?;
        let in_layout = VarLayout::new(comp.in_vars);
        let mut comp_routes = Vec::with_capacity(comp.in_vars.len());

        for (i, var) in comp.in_vars.iter().enumerate() {
            let span = in_layout.span(i);

            // Prefer a component output over an external input; under
            // `ordered` only earlier components qualify and the most recent
            // one wins.
            let produced = producers.get(var.name()).and_then(|list| {
                list.iter()
                    .filter(|p| !ordered || p.component < k)
                    .next_back()
            });

            let (src, src_size) = match produced {
                Some(p) => (
                    SourceRef::Component {
                        index: p.component,
                        offset: p.offset,
                    },
                    p.size,
                ),
                None => match argin_spans.get(var.name()) {
                    Some(&(offset, size)) => (SourceRef::Argin { offset }, size),
                    None => {
                        // Distinguish a forward reference from a missing input.
                        if producers.contains_key(var.name()) {
                            let detail = if is_cyclic_directed(&graph) {
                                "the dependency graph contains a cycle; close the \
                                 feedback loop with an implicit system"
                                    .to_string()
                            } else {
                                format!(
                                    "'{}' is produced only by a later component; \
                                     reorder the components",
                                    var.name()
                                )
                            };
                            return Err(CoupledError::Cycle {
                                component: comp.name.to_string(),
                                variable: var.name().to_string(),
                                detail,
                            });
                        }
                        return Err(CoupledError::UnresolvedInput {
                            component: comp.name.to_string(),
                            variable: var.name().to_string(),
                        });
                    }
                },
            };

            if src_size != span.size {
                return Err(CoupledError::SizeMismatch {
                    expected: span.size,
                    actual: src_size,
                });
            }
            comp_routes.push(Route {
                dst_offset: span.offset,
                size: span.size,
                src,
            });
        }
        routes.push(comp_routes);
    }

    // Resolve the declared system outputs against component outputs.
    let mut argout_sources = Vec::new();
    if let Some(argout) = argout {
        let out_layout = VarLayout::new(argout);
        for (i, var) in argout.iter().enumerate() {
            let span = out_layout.span(i);
            let producer = producers
                .get(var.name())
                .and_then(|list| list.last())
                .ok_or_else(|| CoupledError::UnresolvedOutput {
                    variable: var.name().to_string(),
                })?;
            if producer.size != span.size {
                return Err(CoupledError::SizeMismatch {
                    expected: span.size,
                    actual: producer.size,
                });
            }
            argout_sources.push(ArgoutSource {
                component: producer.component,
                offset: producer.offset,
                size: producer.size,
                dst_offset: span.offset,
            });
        }
    }

    Ok(Routing {
        routes,
        out_offsets,
        total_out,
        argout: argout_sources,
    })
}

impl Routing {
    /// Gather one component's flat input vector from the system input and the
    /// published output vector.
    pub(crate) fn gather_inputs(
        &self,
        component: usize,
        x: &[f64],
        published: &[f64],
        into: &mut [f64],
    ) {
        for route in &self.routes[component] {
            let dst = &mut into[route.dst_offset..route.dst_offset + route.size];
            match route.src {
                SourceRef::Argin { offset } => {
                    dst.copy_from_slice(&x[offset..offset + route.size]);
                }
                SourceRef::Component { index, offset } => {
                    let base = self.out_offsets[index] + offset;
                    dst.copy_from_slice(&published[base..base + route.size]);
                }
            }
        }
    }
}
