use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A semantic type of the IR.
///
/// `Sum` and `Lam` never come from the front end: lambdas only appear as the
/// trailing argument of a higher-order primitive, and sums are introduced by
/// the differentiation engine to tag the trace half of a conditional.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
    Bool,
    Int,
    Float,
    Vec(Rc<Ty>),
    Tuple(Rc<Vec<Ty>>),
    Lam(Rc<Ty>, Rc<Ty>),
    Sum(Rc<Vec<Ty>>),
}

impl Ty {
    /// The empty tuple, doubling as the unit type.
    pub fn unit() -> Self {
        Ty::Tuple(Rc::new(vec![]))
    }

    pub fn tuple(members: Vec<Ty>) -> Self {
        Ty::Tuple(Rc::new(members))
    }

    pub fn vec(elem: Ty) -> Self {
        Ty::Vec(Rc::new(elem))
    }

    pub fn sum(cases: Vec<Ty>) -> Self {
        Ty::Sum(Rc::new(cases))
    }

    /// The type of an infinitesimal perturbation of a value of this type.
    ///
    /// Discrete types carry no derivative information, so their tangent is
    /// unit; containers take tangents pointwise.
    pub fn tangent(&self) -> Ty {
        match self {
            Ty::Float => Ty::Float,
            Ty::Bool | Ty::Int | Ty::Lam(..) | Ty::Sum(..) => Ty::unit(),
            Ty::Vec(elem) => Ty::vec(elem.tangent()),
            Ty::Tuple(members) => Ty::tuple(members.iter().map(Ty::tangent).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tangent_float() {
        assert_eq!(Ty::Float.tangent(), Ty::Float);
    }

    #[test]
    fn test_tangent_discrete() {
        assert_eq!(Ty::Int.tangent(), Ty::unit());
        assert_eq!(Ty::Bool.tangent(), Ty::unit());
    }

    #[test]
    fn test_tangent_structural() {
        let ty = Ty::tuple(vec![Ty::Float, Ty::Int, Ty::vec(Ty::Float)]);
        assert_eq!(
            ty.tangent(),
            Ty::tuple(vec![Ty::Float, Ty::unit(), Ty::vec(Ty::Float)])
        );
    }
}
