//! Allocation-free bound method calls.
//!
//! A [`Callback`] is "call this method on this object", optionally curried
//! with one small value, packed into four machine words. It is `Copy`, so the
//! registry can store heterogeneous behaviour without trait objects or a heap.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{MaybeUninit, size_of};
use core::ptr::NonNull;

use embassy_sync::blocking_mutex::raw::RawMutex;

use super::AsyncValue;
use crate::error::Never;

/// A value that may be bound to a callback as its leading argument.
///
/// The value is stored inline in the callback, so it must be `Copy` and no
/// larger than a pointer. The size limit is checked when the callback is
/// built.
pub trait CallbackData: Copy + Send + Sync {}

impl<T: Copy + Send + Sync> CallbackData for T {}

/// Inline storage for the bound value.
#[derive(Clone, Copy)]
struct Datum(MaybeUninit<*const ()>);

impl Datum {
    const EMPTY: Self = Self(MaybeUninit::uninit());

    fn new<D: CallbackData>(value: D) -> Self {
        const { assert!(size_of::<D>() <= size_of::<*const ()>()) };
        let mut slot = MaybeUninit::<*const ()>::uninit();
        // SAFETY: `D` fits in the slot; the write does not assume alignment.
        unsafe { slot.as_mut_ptr().cast::<D>().write_unaligned(value) };
        Self(slot)
    }

    /// # Safety
    ///
    /// The datum must have been created from a value of type `D`.
    unsafe fn read<D: CallbackData>(self) -> D {
        unsafe { self.0.as_ptr().cast::<D>().read_unaligned() }
    }
}

type Trampoline<A, R> = unsafe fn(NonNull<()>, *const (), Datum, &A) -> R;

/// A method bound to an object.
///
/// Invoking the callback calls the method with the owner as receiver, the
/// bound value (if any), and the call-site argument. Several arguments are
/// passed as a tuple.
///
/// Unlike a boxed closure, no allocation ever occurs: the callback only
/// holds a pointer to its owner, the method, and one pointer-sized value.
/// The owner is borrowed for `'a`, so it outlives every callback bound to it.
///
/// # Example
///
/// ```ignore
/// struct Altimeter { samples: AtomicU32 }
///
/// impl Altimeter {
///     fn on_frame(&self, frame: &Frame) { self.samples.fetch_add(1, Relaxed); }
/// }
///
/// let alt = Altimeter { samples: AtomicU32::new(0) };
/// let cb = Callback::new(&alt, Altimeter::on_frame);
/// cb.call(&frame);
/// ```
pub struct Callback<'a, A: ?Sized, R = ()> {
    owner: NonNull<()>,
    method: *const (),
    data: Datum,
    trampoline: Trampoline<A, R>,
    _owner: PhantomData<&'a ()>,
}

// SAFETY: constructors only accept `Sync` owners and `Send + Sync` data, and
// the method is a plain function pointer.
unsafe impl<A: ?Sized, R> Send for Callback<'_, A, R> {}
unsafe impl<A: ?Sized, R> Sync for Callback<'_, A, R> {}

impl<A: ?Sized, R> Clone for Callback<'_, A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: ?Sized, R> Copy for Callback<'_, A, R> {}

impl<A: ?Sized, R> fmt::Debug for Callback<'_, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("owner", &self.owner)
            .field("method", &self.method)
            .finish()
    }
}

impl<'a, A: ?Sized, R> Callback<'a, A, R> {
    /// Binds `method` to `owner`.
    pub fn new<O: Sync>(owner: &'a O, method: fn(&O, &A) -> R) -> Self {
        Self {
            owner: NonNull::from(owner).cast(),
            method: method as *const (),
            data: Datum::EMPTY,
            trampoline: call_method::<O, A, R>,
            _owner: PhantomData,
        }
    }

    /// Binds `method` to `owner` and curries it with `data`.
    ///
    /// `data` is passed to the method ahead of the call-site argument.
    /// Compilation fails if `D` is larger than a pointer.
    pub fn with_data<O: Sync, D: CallbackData + 'a>(
        owner: &'a O,
        method: fn(&O, D, &A) -> R,
        data: D,
    ) -> Self {
        Self {
            owner: NonNull::from(owner).cast(),
            method: method as *const (),
            data: Datum::new(data),
            trampoline: call_curried::<O, D, A, R>,
            _owner: PhantomData,
        }
    }

    /// Invokes the callback.
    pub fn call(&self, arg: &A) -> R {
        // SAFETY: the trampoline was monomorphised for the owner, method and
        // datum types this callback was built from, and `'a` keeps the owner
        // alive.
        unsafe { (self.trampoline)(self.owner, self.method, self.data, arg) }
    }
}

unsafe fn call_method<O, A: ?Sized, R>(
    owner: NonNull<()>,
    method: *const (),
    _data: Datum,
    arg: &A,
) -> R {
    // SAFETY: `method` was erased from exactly this function pointer type.
    let method = unsafe { core::mem::transmute::<*const (), fn(&O, &A) -> R>(method) };
    method(unsafe { owner.cast::<O>().as_ref() }, arg)
}

unsafe fn call_curried<O, D: CallbackData, A: ?Sized, R>(
    owner: NonNull<()>,
    method: *const (),
    data: Datum,
    arg: &A,
) -> R {
    // SAFETY: `method` was erased from exactly this function pointer type and
    // `data` was written from a `D`.
    let method = unsafe { core::mem::transmute::<*const (), fn(&O, D, &A) -> R>(method) };
    let value = unsafe { data.read::<D>() };
    method(unsafe { owner.cast::<O>().as_ref() }, value, arg)
}

/// Writes every invocation's argument into an [`AsyncValue`].
impl<'a, T, M> From<&'a AsyncValue<T, M>> for Callback<'a, T>
where
    T: Clone + Send,
    M: RawMutex + Sync,
{
    fn from(slot: &'a AsyncValue<T, M>) -> Self {
        Callback::new(slot, AsyncValue::<T, M>::set)
    }
}

/// Describes the shape of callback a capability requires.
///
/// `RequiredSignature` has no values. It converts into any
/// `Callback<'_, A, R>`, so it can stand in for "a callback taking `&A` and
/// returning `R`" when checking at compile time that a type provides a
/// capability, but it can never be created or invoked.
pub struct RequiredSignature<A: ?Sized, R = ()> {
    never: Never,
    _shape: PhantomData<fn(&A) -> R>,
}

impl<A: ?Sized, R> RequiredSignature<A, R> {
    /// Proves the signature is never instantiated.
    pub fn unreachable(&self) -> ! {
        match self.never {}
    }
}

impl<A: ?Sized, R> From<RequiredSignature<A, R>> for Callback<'_, A, R> {
    fn from(sig: RequiredSignature<A, R>) -> Self {
        sig.unreachable()
    }
}
