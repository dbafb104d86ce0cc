//! The interface the parser and symbol repository present to the
//! core. The core never parses source text; it consumes generic
//! graphs delivered through [SymbolSource].

use crate::{
    graph::GenericId,
    typ::{self, Type, FUNCTION},
};
use arcstr::ArcStr;

/// how a form participates in overload resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormAttribute {
    None,
    Extend,
    Pattern,
    MayOverride,
    AlwaysOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormMode {
    Macro,
    Function,
}

#[derive(Debug, Clone)]
pub struct Form {
    pub body: GenericId,
    pub attribute: FormAttribute,
    pub mode: FormMode,
}

#[derive(Debug, Clone)]
pub struct SymbolDef {
    pub qualified_name: ArcStr,
    pub forms: Vec<Form>,
    pub metadata: Type,
}

/// an import request resolved by the repository, not by the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Import {
    pub package: ArcStr,
    pub version: ArcStr,
    pub path: ArcStr,
    pub relative_base: ArcStr,
}

/// Resolves qualified names to symbol definitions. The repository
/// behind this seam owns parsing, import resolution and versioning.
pub trait SymbolSource {
    fn resolve(&self, qualified_name: &str) -> Option<&SymbolDef>;
}

/// an empty source for programs that never leave the root expression
pub struct NoSymbols;

impl SymbolSource for NoSymbols {
    fn resolve(&self, _qualified_name: &str) -> Option<&SymbolDef> {
        None
    }
}

/// Pack a symbol's forms into the first class function value consumed
/// by the evaluator: `Function{(name, recursion-points, forms, nil)}`.
pub fn function_value(
    name: &ArcStr,
    recursion_points: &[GenericId],
    forms: &[GenericId],
) -> Type {
    let name_t = Type::InvariantString(name.clone());
    let recur = forms_list(recursion_points);
    let forms = forms_list(forms);
    Type::user(
        &FUNCTION,
        typ::pair(name_t, typ::pair(recur, typ::pair(forms, Type::Nil))),
    )
}

fn forms_list(ids: &[GenericId]) -> Type {
    let mut t = Type::Nil;
    for id in ids.iter().rev() {
        t = typ::pair(Type::InvariantGraph(*id), t);
    }
    t
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{GenericGraph, GenericOp};
    use smallvec::smallvec;

    #[test]
    fn function_value_shape() {
        let mut g = GenericGraph::new();
        let body = g.add(GenericOp::Argument, smallvec![]);
        let f = function_value(&arcstr::literal!("id"), &[], &[body]);
        assert!(f.is_user_type_of(&FUNCTION));
        let content = f.unwrap_user().expect("content");
        assert_eq!(
            content.element(0),
            Type::InvariantString(arcstr::literal!("id"))
        );
        assert!(content.element(1).is_nil());
        assert_eq!(content.element(2).element(0), Type::InvariantGraph(body));
    }
}
