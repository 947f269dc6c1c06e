//! [`Reflect`] for standard library types

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use super::{LiveObject, Reflect, Role, Shape};

macro_rules! scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Reflect for $ty {
                fn shape(&self) -> Shape {
                    Shape::Scalar
                }
            }
        )*
    };
}

scalar!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
);

macro_rules! elements {
    ($shape:expr, $($ty:ident<T $(, $extra:ident)*>),* $(,)?) => {
        $(
            impl<T: Reflect $(, $extra: 'static)*> Reflect for $ty<T $(, $extra)*> {
                fn shape(&self) -> Shape {
                    $shape
                }

                fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
                    for item in self {
                        visit(Role::Element, item);
                    }
                }
            }
        )*
    };
}

elements!(Shape::Sequence, Vec<T>, VecDeque<T>);
elements!(Shape::Set, HashSet<T, S>, BTreeSet<T>);

impl<T: Reflect, const N: usize> Reflect for [T; N] {
    fn shape(&self) -> Shape {
        Shape::Sequence
    }

    fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
        for item in self {
            visit(Role::Element, item);
        }
    }
}

impl<K: Reflect, V: Reflect, S: 'static> Reflect for HashMap<K, V, S> {
    fn shape(&self) -> Shape {
        Shape::Mapping
    }

    fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
        for (key, value) in self {
            visit(Role::Key, key);
            visit(Role::Value, value);
        }
    }
}

impl<K: Reflect, V: Reflect> Reflect for BTreeMap<K, V> {
    fn shape(&self) -> Shape {
        Shape::Mapping
    }

    fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
        for (key, value) in self {
            visit(Role::Key, key);
            visit(Role::Value, value);
        }
    }
}

impl<T: Reflect> Reflect for Option<T> {
    fn shape(&self) -> Shape {
        Shape::Optional
    }

    fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
        if let Some(payload) = self {
            visit(Role::Payload, payload);
        }
    }
}

// Smart pointers are transparent: they report the shape of their target.
macro_rules! transparent {
    ($($ptr:ident),* $(,)?) => {
        $(
            impl<T: Reflect + ?Sized> Reflect for $ptr<T> {
                fn shape(&self) -> Shape {
                    (**self).shape()
                }

                fn type_name(&self) -> Cow<'_, str> {
                    (**self).type_name()
                }

                fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
                    (**self).visit_children(visit)
                }

                fn as_object(&self) -> Option<&dyn LiveObject> {
                    (**self).as_object()
                }
            }
        )*
    };
}

transparent!(Box, Arc, Rc);

macro_rules! tuple {
    ($(($($name:ident : $index:tt),+)),* $(,)?) => {
        $(
            impl<$($name: Reflect),+> Reflect for ($($name,)+) {
                fn shape(&self) -> Shape {
                    Shape::Record
                }

                fn visit_children(&self, visit: &mut dyn FnMut(Role<'_>, &dyn Reflect)) {
                    $(visit(Role::Field(stringify!($index)), &self.$index);)+
                }
            }
        )*
    };
}

tuple!(
    (A: 0),
    (A: 0, B: 1),
    (A: 0, B: 1, C: 2),
    (A: 0, B: 1, C: 2, D: 3),
);

#[cfg(test)]
mod tests {
    use super::*;

    fn children(value: &dyn Reflect) -> Vec<String> {
        let mut seen = Vec::new();
        value.visit_children(&mut |role, child| {
            seen.push(format!("{:?}:{:?}", role, child.shape()));
        });
        seen
    }

    #[test]
    fn test_shapes() {
        assert_eq!(42i32.shape(), Shape::Scalar);
        assert_eq!("text".to_string().shape(), Shape::Scalar);
        assert_eq!(vec![1u8].shape(), Shape::Sequence);
        assert_eq!(BTreeSet::<u8>::new().shape(), Shape::Set);
        assert_eq!(HashMap::<String, u8>::new().shape(), Shape::Mapping);
        assert_eq!(Some(1u8).shape(), Shape::Optional);
        assert_eq!((1u8, "a").shape(), Shape::Record);
        assert_eq!(Box::new(vec![1u8]).shape(), Shape::Sequence);
    }

    #[test]
    fn test_children() {
        assert_eq!(children(&vec![1u8, 2]), vec!["Element:Scalar", "Element:Scalar"]);
        assert_eq!(children(&None::<u8>), Vec::<String>::new());
        assert_eq!(children(&Some(vec![1u8])), vec!["Payload:Sequence"]);

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), vec![1u8]);
        assert_eq!(children(&map), vec!["Key:Scalar", "Value:Sequence"]);

        assert_eq!(
            children(&(1u8, Some(2u8))),
            vec!["Field(\"0\"):Scalar", "Field(\"1\"):Optional"]
        );
    }

    #[test]
    fn test_type_name_through_pointer() {
        let boxed: Arc<dyn Reflect + Send + Sync> = Arc::new(7u32);
        assert_eq!(boxed.type_name(), "u32");
    }
}
